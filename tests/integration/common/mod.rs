#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use lutrainit::service::{RunState, ServiceTable};

/// Builds a configuration tree (lutra.conf plus lutra.d/) under `dir`.
pub struct ConfigTree {
    pub base: PathBuf,
}

impl ConfigTree {
    pub fn create(dir: &Path) -> Self {
        let base = dir.join("lutrainit");
        fs::create_dir_all(base.join("lutra.d")).unwrap();
        fs::write(base.join("lutra.conf"), "[global]\nPersist = true\n")
            .unwrap();
        Self { base }
    }

    pub fn write_main_config(&self, content: &str) {
        fs::write(self.base.join("lutra.conf"), content).unwrap();
    }

    pub fn write_unit(&self, name: &str, content: &str) {
        fs::write(self.base.join("lutra.d").join(name), content).unwrap();
    }

    pub fn remove_unit(&self, name: &str) {
        fs::remove_file(self.base.join("lutra.d").join(name)).unwrap();
    }
}

/// A minimal oneshot unit body.
pub fn oneshot_unit(wanted_by: &str, requires: &str, exec: &str) -> String {
    format!(
        "[order]\nRequires = {requires}\nWantedBy = {wanted_by}\n\n\
         [service]\nType = oneshot\nAutostart = true\nExecStart = {exec}\n"
    )
}

/// A minimal simple unit body.
pub fn simple_unit(wanted_by: &str, requires: &str, exec: &str) -> String {
    format!(
        "[order]\nRequires = {requires}\nWantedBy = {wanted_by}\n\n\
         [service]\nType = simple\nAutostart = true\nExecStart = {exec}\n"
    )
}

/// A bare target unit body.
pub fn target_unit(requires: &str) -> String {
    format!("[order]\nRequires = {requires}\n\n[service]\n")
}

/// Polls the table until `name` reaches `wanted` or a timeout expires, and
/// returns the final state.
pub fn wait_for_state(
    table: &ServiceTable,
    name: &str,
    wanted: RunState,
) -> RunState {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = table.state_of(name).unwrap().unwrap();
        if state == wanted || Instant::now() >= deadline {
            return state;
        }
        thread::sleep(Duration::from_millis(50));
    }
}
