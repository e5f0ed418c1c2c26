use super::{DispatchHook, EngineDocument, EngineInstance, EngineKind, StatsSource};
use crate::error::{EngineError, Result};
use crate::relay::DispatchRelay;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Writes an engine document to `<data_dir>/<kind>.json`.
pub async fn write_document(data_dir: &str, document: &EngineDocument) -> Result<PathBuf> {
    tokio::fs::create_dir_all(data_dir).await?;
    let path = Path::new(data_dir).join(format!("{}.json", document.kind));
    let content = serde_json::to_vec_pretty(&document.body)?;
    tokio::fs::write(&path, content).await?;
    debug!("Wrote {} configuration to {}", document.kind, path.display());
    Ok(path)
}

/// An engine running as a supervised child process.
pub struct ProcessInstance {
    kind: EngineKind,
    program: String,
    args: Vec<String>,
    startup_grace: Duration,
    stats: Arc<dyn StatsSource>,
    relay: Option<Arc<DispatchRelay>>,
    child: Option<Child>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProcessInstance {
    pub fn new(
        kind: EngineKind,
        program: String,
        args: Vec<String>,
        startup_grace: Duration,
        stats: Arc<dyn StatsSource>,
        relay: Option<Arc<DispatchRelay>>,
    ) -> Self {
        Self {
            kind,
            program,
            args,
            startup_grace,
            stats,
            relay,
            child: None,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl EngineInstance for ProcessInstance {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        // the relay has to accept before the engine dials it
        if let Some(relay) = &self.relay {
            let listener = relay.bind().await?;
            self.tasks.push(relay.clone().serve(listener, cancel.child_token()));
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Launch(format!("failed to spawn {}: {}", self.program, e)))?;
        info!("Started {} (pid {:?})", self.kind, child.id());

        if let Some(stderr) = child.stderr.take() {
            let kind = self.kind;
            let cancel = cancel.clone();
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        line = lines.next_line() => match line {
                            Ok(Some(line)) => debug!(engine = %kind, "{}", line),
                            _ => break,
                        },
                    }
                }
            }));
        }

        tokio::time::sleep(self.startup_grace).await;
        if let Some(status) = child.try_wait()? {
            return Err(EngineError::Launch(format!(
                "{} exited during startup with {}",
                self.kind, status
            )));
        }

        self.child = Some(child);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                warn!("Failed to signal {}: {}", self.kind, e);
            }
            let status = child.wait().await?;
            info!("{} exited with {}", self.kind, status);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn stats_source(&self) -> Arc<dyn StatsSource> {
        self.stats.clone()
    }

    fn dispatch_hook(&self) -> Option<Arc<dyn DispatchHook>> {
        self.relay
            .clone()
            .map(|relay| relay as Arc<dyn DispatchHook>)
    }
}
