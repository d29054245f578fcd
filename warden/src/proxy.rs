//! Reverse-proxy registration. Layer 7 writes upstream and server
//! blocks into the proxy's include directories; layer 4 appends
//! ip-level forwards to a single file. Both are keyed by the owning
//! container uuid so teardown is a filter, not a parse.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::{WardenError, WardenResult};
use crate::exec::{Cmd, CommandRunner};

/// A layer-7 mapping: requests for `url` are proxied to the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlMapping {
    pub url: String,
    #[serde(default)]
    pub cert: Option<String>,
    #[serde(default)]
    pub max_file_size: Option<String>,
    #[serde(default)]
    pub websocket: bool,
    #[serde(default)]
    pub redirects: Vec<String>,
}

impl UrlMapping {
    /// Hostname part of the url, before any path component.
    pub fn hostname(&self) -> &str {
        self.url.split('/').next().unwrap_or(&self.url)
    }

    pub fn path(&self) -> String {
        match self.url.split_once('/') {
            Some((_, rest)) => format!("/{}", rest),
            None => "/".to_string(),
        }
    }
}

/// A layer-4 forward: host port to container port, no termination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Layer4Forward {
    pub proto: String,
    pub host_port: u16,
    pub container_port: u16,
}

pub struct ProxyRegistrar {
    config_dir: PathBuf,
    forwards_file: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ProxyRegistrar {
    pub fn new(config_dir: &Path, forwards_file: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config_dir: config_dir.to_path_buf(),
            forwards_file: forwards_file.to_path_buf(),
            runner,
        }
    }

    fn upstream_dir(&self) -> PathBuf {
        self.config_dir.join("upstream")
    }

    fn server_dir(&self) -> PathBuf {
        self.config_dir.join("server_name")
    }

    fn access_dir(&self) -> PathBuf {
        self.config_dir.join("access")
    }

    fn sanitized(name: &str) -> String {
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect()
    }

    /// Register one url mapping for a container. A non-empty `access`
    /// list becomes an allow/deny include on the location, so only the
    /// whitelisted sources reach the backend. Returns the config files
    /// written, which the caller records for teardown.
    pub fn register_url(
        &self,
        owner: &str,
        mapping: &UrlMapping,
        ip: Ipv4Addr,
        access: &[String],
    ) -> WardenResult<(PathBuf, PathBuf)> {
        if mapping.url.is_empty() {
            return Err(WardenError::Validation("empty url mapping".into()));
        }
        std::fs::create_dir_all(self.upstream_dir())?;
        std::fs::create_dir_all(self.server_dir())?;

        let hostname = Self::sanitized(mapping.hostname());
        let port = if mapping.cert.is_some() { 443 } else { 80 };

        let upstream_name = format!("{}-{}", owner, hostname);
        let upstream_path = self.upstream_dir().join(&upstream_name);
        let upstream = format!(
            "# owner: {}\nupstream {} {{\n    server {}:{};\n}}\n",
            owner, upstream_name, ip, port
        );
        std::fs::write(&upstream_path, upstream)?;

        let server_path = self.server_dir().join(format!("{}-{}", owner, hostname));
        let mut server = format!("# owner: {}\nserver {{\n", owner);
        if let Some(cert) = &mapping.cert {
            server.push_str("    listen 443 ssl;\n");
            server.push_str(&format!("    ssl_certificate {};\n", cert));
        } else {
            server.push_str("    listen 80;\n");
        }
        server.push_str(&format!("    server_name {};\n", mapping.hostname()));
        if let Some(size) = &mapping.max_file_size {
            server.push_str(&format!("    client_max_body_size {};\n", size));
        }
        server.push_str(&format!("    location {} {{\n", mapping.path()));
        if !access.is_empty() {
            std::fs::create_dir_all(self.access_dir())?;
            let access_path = self.access_dir().join(format!("{}-{}", owner, hostname));
            let mut body = format!("# owner: {}\n", owner);
            for source in access {
                body.push_str(&format!("allow {};\n", source));
            }
            body.push_str("deny all;\n");
            std::fs::write(&access_path, body)?;
            server.push_str(&format!("        include {};\n", access_path.display()));
        }
        let scheme = if mapping.cert.is_some() { "https" } else { "http" };
        server.push_str(&format!(
            "        proxy_pass {}://{};\n",
            scheme, upstream_name
        ));
        if mapping.websocket {
            server.push_str("        proxy_http_version 1.1;\n");
            server.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
            server.push_str("        proxy_set_header Connection \"upgrade\";\n");
        }
        server.push_str("    }\n");
        for redirect in &mapping.redirects {
            server.push_str(&format!(
                "    # redirect {} -> {}\n",
                redirect, mapping.url
            ));
        }
        server.push_str("}\n");
        std::fs::write(&server_path, server)?;

        info!(owner, url = %mapping.url, %ip, "registered url mapping");
        Ok((upstream_path, server_path))
    }

    /// Write a plain redirect server block for an alternate url.
    pub fn register_redirect(
        &self,
        owner: &str,
        from: &str,
        to: &str,
        cert: Option<&str>,
    ) -> WardenResult<PathBuf> {
        std::fs::create_dir_all(self.server_dir())?;
        let hostname = Self::sanitized(from.split('/').next().unwrap_or(from));
        let path = self
            .server_dir()
            .join(format!("{}-redirect-{}", owner, hostname));
        let mut body = format!("# owner: {}\nserver {{\n", owner);
        match cert {
            Some(cert) => {
                body.push_str("    listen 443 ssl;\n");
                body.push_str(&format!("    ssl_certificate {};\n", cert));
            }
            None => body.push_str("    listen 80;\n"),
        }
        body.push_str(&format!("    server_name {};\n", from));
        body.push_str(&format!("    return 301 $scheme://{}$request_uri;\n", to));
        body.push_str("}\n");
        std::fs::write(&path, body)?;
        Ok(path)
    }

    /// Append a layer-4 forward, keyed by owner for retraction.
    pub fn register_layer4(
        &self,
        owner: &str,
        ip: Ipv4Addr,
        forward: &Layer4Forward,
    ) -> WardenResult<()> {
        match forward.proto.as_str() {
            "tcp" | "udp" => {}
            other => {
                return Err(WardenError::Validation(format!(
                    "layer-4 proto must be tcp or udp, got {:?}",
                    other
                )))
            }
        }
        if let Some(parent) = self.forwards_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = format!(
            "{} {} {} {} # {}\n",
            forward.proto, forward.host_port, ip, forward.container_port, owner
        );
        let mut existing = if self.forwards_file.exists() {
            std::fs::read_to_string(&self.forwards_file)?
        } else {
            String::new()
        };
        existing.push_str(&line);
        std::fs::write(&self.forwards_file, existing)?;
        info!(owner, proto = %forward.proto, host_port = forward.host_port, "registered layer-4 forward");
        Ok(())
    }

    /// Remove every proxy artifact a container owns: its upstream and
    /// server files and its layer-4 forward lines.
    pub fn retract_owner(&self, owner: &str) -> WardenResult<()> {
        for dir in [self.upstream_dir(), self.server_dir(), self.access_dir()] {
            if !dir.is_dir() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if name.starts_with(&format!("{}-", owner)) {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        if self.forwards_file.exists() {
            let marker = format!("# {}", owner);
            let kept: String = std::fs::read_to_string(&self.forwards_file)?
                .lines()
                .filter(|line| !line.trim_end().ends_with(&marker))
                .map(|line| format!("{}\n", line))
                .collect();
            if kept.is_empty() {
                std::fs::remove_file(&self.forwards_file)?;
            } else {
                std::fs::write(&self.forwards_file, kept)?;
            }
        }
        info!(owner, "retracted proxy registrations");
        Ok(())
    }

    /// Reload the proxy; best-effort like the resolver reload.
    pub fn reload(&self) {
        let cmd = Cmd::new("service").args(["nginx", "reload"]);
        match self.runner.run(&cmd) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(status = out.status, "proxy reload failed"),
            Err(err) => warn!(%err, "proxy reload failed"),
        }
    }
}
