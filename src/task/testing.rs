//! Fake scan tools for tests.
//!
//! Both tools are replaced by one shell script that writes a canned result
//! line to the `-o` path. Runs are keyed by their last argument: while
//! `<gate>/<key>.hold` exists the run blocks, and `<gate>/<key>.fail` makes
//! it exit with code 2.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use uuid::Uuid;

use super::{Task, TaskManager};
use crate::artifact::FsArtifactStore;
use crate::catalog::Catalog;
use crate::config::{Settings, ToolSettings, ToolsSettings};
use crate::store::RecordStore;

pub(crate) const XMAP_LINE: &str =
    r#"{"saddr":"2001:db8::1","outersaddr":"2001:db8::1","success":1}"#;

pub(crate) const ZGRAB_LINE: &str =
    r#"{"ip":"2001:db8::1","data":{"http":{"status":"success","protocol":"http"}}}"#;

const SCRIPT: &str = r#"
out=""
prev=""
last=""
for arg in "$@"; do
  if [ "$prev" = "-o" ]; then out="$arg"; fi
  prev="$arg"
  last="$arg"
done
while [ -e "$GATE_DIR/$last.hold" ]; do sleep 0.05; done
if [ -e "$GATE_DIR/$last.fail" ]; then
  echo "scan failed for $last" >&2
  exit 2
fi
printf '%s\n' "$FAKE_OUTPUT" > "$out"
echo "scanned $last"
"#;

pub(crate) struct FakeTools {
    pub dir: TempDir,
    pub gate: PathBuf,
    pub settings: Settings,
}

impl FakeTools {
    pub fn new(max_running_tasks: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let gate = dir.path().join("gate");
        fs::create_dir_all(&gate).unwrap();
        let script = dir.path().join("fake-tool.sh");
        fs::write(&script, SCRIPT).unwrap();

        // Run through /bin/sh so the script never has to be executable
        let tool = |output: &str| ToolSettings {
            launcher: vec!["/bin/sh".to_string()],
            env: BTreeMap::from([
                ("GATE_DIR".to_string(), gate.display().to_string()),
                ("FAKE_OUTPUT".to_string(), output.to_string()),
            ]),
            ..ToolSettings::new(script.display().to_string())
        };

        let settings = Settings {
            max_running_tasks,
            kill_grace_secs: 1,
            tools: ToolsSettings {
                scanner: tool(XMAP_LINE),
                grabber: tool(ZGRAB_LINE),
            },
            ..Settings::default()
        };

        Self { dir, gate, settings }
    }

    pub fn hold(&self, key: &str) {
        fs::write(self.gate.join(format!("{}.hold", key)), b"").unwrap();
    }

    pub fn release(&self, key: &str) {
        let _ = fs::remove_file(self.gate.join(format!("{}.hold", key)));
    }

    pub fn fail(&self, key: &str) {
        fs::write(self.gate.join(format!("{}.fail", key)), b"").unwrap();
    }

    pub fn manager(&self) -> TaskManager {
        self.manager_with(RecordStore::ephemeral())
    }

    pub fn manager_with(&self, records: RecordStore<Task>) -> TaskManager {
        let artifacts = FsArtifactStore::new(self.dir.path().join("artifacts")).unwrap();
        TaskManager::new(
            &self.settings,
            Arc::new(Catalog::builtin()),
            Arc::new(artifacts),
            records,
            RecordStore::ephemeral(),
        )
    }
}

/// Waits for a Task to finish, failing the test after ten seconds.
pub(crate) async fn finished(manager: &TaskManager, id: Uuid) -> Task {
    tokio::time::timeout(Duration::from_secs(10), manager.wait_terminal(id))
        .await
        .expect("task did not finish in time")
        .unwrap()
}
