//! Shared test fixtures: a scripted command runner and a host config
//! rooted in a temp directory.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use warden::exec::{Cmd, CmdOutput, CommandRunner};
use warden::{HostConfig, MemoryStore, PropertyStore, WardenResult};

/// Command runner that never touches the host. Every invocation is
/// recorded; responses are matched by command-line prefix, jail
/// liveness is driven by an explicit running set, and everything else
/// succeeds with empty output.
#[derive(Default)]
pub struct FakeRunner {
    responses: Mutex<Vec<(String, CmdOutput)>>,
    calls: Mutex<Vec<String>>,
    running: Mutex<HashSet<String>>,
    epair_counter: Mutex<u32>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: &str, output: CmdOutput) {
        self.responses.lock().push((prefix.to_string(), output));
    }

    pub fn ok(stdout: &str) -> CmdOutput {
        CmdOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(status: i32, stderr: &str) -> CmdOutput {
        CmdOutput {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn set_running(&self, jail: &str, running: bool) {
        if running {
            self.running.lock().insert(jail.to_string());
        } else {
            self.running.lock().remove(jail);
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn called_with_prefix(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }
}

impl CommandRunner for FakeRunner {
    fn run(&self, cmd: &Cmd) -> WardenResult<CmdOutput> {
        let display = cmd.display();
        self.calls.lock().push(display.clone());

        for (prefix, output) in self.responses.lock().iter() {
            if display.starts_with(prefix) {
                return Ok(output.clone());
            }
        }
        if let Some(jail) = display.strip_prefix("jls -j ") {
            return Ok(if self.running.lock().contains(jail) {
                Self::ok("")
            } else {
                Self::fail(1, &format!("jls: jail \"{}\" not found", jail))
            });
        }
        if display == "ifconfig epair create" {
            let mut counter = self.epair_counter.lock();
            let name = format!("epair{}a\n", *counter);
            *counter += 1;
            return Ok(Self::ok(&name));
        }
        if display.starts_with("jail -c ") {
            // a created jail is immediately live
            if let Some(name) = display
                .split_whitespace()
                .find_map(|arg| arg.strip_prefix("name="))
            {
                self.running.lock().insert(name.to_string());
            }
            return Ok(Self::ok(""));
        }
        if let Some(name) = display.strip_prefix("jail -r ") {
            self.running.lock().remove(name);
            return Ok(Self::ok(""));
        }
        Ok(Self::ok(""))
    }
}

/// A HostConfig whose every host path lives under `base`, plus a
/// release skeleton so creation has something to populate from.
pub fn test_config(base: &Path) -> HostConfig {
    let mut config = HostConfig::default();
    config.partitions_mount = base.join("ptn");
    config.releases_mount = base.join("releases");
    config.dns_config_dir = base.join("unbound");
    config.proxy_config_dir = base.join("nginx");
    config.layer4_forwards_file = base.join("nginx/layer4");
    config.pkg_cache_dir = base.join("pkg-cache");
    config.lock_dir = base.join("locks");

    let release_root = config.release_root(&config.default_release);
    std::fs::create_dir_all(release_root.join("etc")).unwrap();
    std::fs::write(release_root.join("etc/hosts"), "::1 localhost\n").unwrap();
    std::fs::create_dir_all(release_root.join("root")).unwrap();
    std::fs::create_dir_all(release_root.join("var/log")).unwrap();
    config
}

/// A memory store with the default partition materialized the way the
/// partition manager would.
pub fn store_with_default_partition(config: &HostConfig) -> Arc<dyn PropertyStore> {
    let store: Arc<dyn PropertyStore> = Arc::new(MemoryStore::new());
    let dataset = config.partition_dataset("default");
    store
        .create_dataset(&dataset, &config.partition_mount("default"))
        .unwrap();
    let containers = config.container_parent_dataset("default");
    store
        .create_dataset(
            &containers,
            &config.partition_mount("default").join("cntr"),
        )
        .unwrap();
    std::fs::create_dir_all(config.partition_mount("default").join("data")).unwrap();
    store
}
