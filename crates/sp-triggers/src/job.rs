// SPDX-License-Identifier: Apache-2.0

//! One-shot job trigger: reads a synthetic event from configured
//! attributes, submits it exactly once, and writes the response out.
//!
//! The source material keeps two near-duplicate implementations of this
//! trigger, one synchronous and one driven by an async wait channel. We
//! keep the synchronous one: `start` does all of its work inline and
//! returns once the handler has answered, so `stop` has nothing left to
//! tear down and never has to race a background task or kill the process.

use async_trait::async_trait;
use fnmesh_config::JobTriggerAttributes;
use fnmesh_event::{Event, TriggerInfo, TriggerVariant};
use fnmesh_trigger::{
    Trigger, TriggerCore, TriggerError, TriggerFactoryContext, TriggerRegistry, TriggerStatus,
};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info};

pub const KIND: &str = "job";

pub struct JobTrigger {
    core: TriggerCore,
    attrs: JobTriggerAttributes,
    timeout: Duration,
}

impl JobTrigger {
    pub fn new(core: TriggerCore, attrs: JobTriggerAttributes, timeout: Duration) -> Self {
        JobTrigger {
            core,
            attrs,
            timeout,
        }
    }

    async fn read_body(&self) -> Result<Vec<u8>, TriggerError> {
        if let Some(path) = &self.attrs.input_path {
            tokio::fs::read(path)
                .await
                .map_err(|e| TriggerError::Remote(format!("reading {path}: {e}")))
        } else if let Some(body) = &self.attrs.body {
            Ok(body.clone().into_bytes())
        } else {
            Ok(Vec::new())
        }
    }

    async fn write_output(&self, body: &[u8]) -> Result<(), TriggerError> {
        let Some(path) = &self.attrs.output_path else {
            return Ok(());
        };
        let trimmed = String::from_utf8_lossy(body).trim_end().to_owned();
        tokio::fs::write(path, trimmed)
            .await
            .map_err(|e| TriggerError::Remote(format!("writing {path}: {e}")))
    }
}

#[async_trait]
impl Trigger for JobTrigger {
    async fn start(&self, _checkpoint: fnmesh_trigger::Checkpoint) -> Result<(), TriggerError> {
        self.core.set_status(TriggerStatus::Initializing);
        let body = self.read_body().await?;

        let info = TriggerInfo {
            class: "trigger".into(),
            kind: KIND.into(),
            name: self.core.name.clone(),
        };
        let event = Event::new(TriggerVariant::Job, info).with_body(body);

        self.core.set_status(TriggerStatus::Ready);
        let outcome = self
            .core
            .allocate_worker_and_submit_event(event, self.timeout)
            .await;

        if outcome.timed_out {
            self.core.set_status(TriggerStatus::Stopped);
            return Err(TriggerError::Remote("job timed out waiting on a worker".into()));
        }
        if let Some(err) = outcome.submit_err {
            self.core.set_status(TriggerStatus::Stopped);
            error!(trigger = %self.core.id, %err, "job handler failed");
            return Err(TriggerError::Remote(err.to_string()));
        }
        if let Some(resp) = outcome.response {
            self.write_output(&resp.body).await?;
            info!(trigger = %self.core.id, "job completed");
        }
        self.core.set_status(TriggerStatus::Stopped);
        Ok(())
    }

    async fn stop(&self, _force: bool) -> Result<fnmesh_trigger::Checkpoint, TriggerError> {
        self.core.set_status(TriggerStatus::Stopped);
        Ok(None)
    }

    fn get_config(&self) -> serde_json::Value {
        self.core.config.clone()
    }

    fn status(&self) -> TriggerStatus {
        self.core.status()
    }
}

pub fn register(registry: &mut TriggerRegistry) {
    registry.register(KIND, |ctx: TriggerFactoryContext| {
        let attrs = JobTriggerAttributes::parse(&ctx.config)
            .map_err(|e| TriggerError::Config(e.to_string()))?;
        let timeout = Duration::from_millis(5_000);
        let core = TriggerCore::new(ctx);
        Ok(Arc::new(JobTrigger::new(core, attrs, timeout)) as Arc<dyn Trigger>)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use fnmesh_worker::{Runtime, RuntimeError, WorkerAllocator, WorkerPool};
    use tokio::sync::mpsc;

    struct PrependRuntime;
    #[async_trait]
    impl Runtime for PrependRuntime {
        async fn invoke(
            &self,
            event: Event,
        ) -> Result<fnmesh_event::Response, RuntimeError> {
            let mut body = b"Got ".to_vec();
            body.extend_from_slice(event.get_body());
            body.extend_from_slice(b". Job done.\n");
            Ok(fnmesh_event::Response::new().with_body(body))
        }
    }

    #[tokio::test]
    async fn job_reads_input_file_and_writes_trimmed_output() {
        let dir = std::env::temp_dir().join(format!("fnmesh-job-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let input = dir.join("in.txt");
        let output = dir.join("out.txt");
        tokio::fs::write(&input, "job text").await.unwrap();

        let allocator: Arc<dyn WorkerAllocator> = Arc::new(WorkerPool::new(1, PrependRuntime));
        let (restart_tx, _rx) = mpsc::channel(1);
        let ctx = TriggerFactoryContext {
            id: "j1".into(),
            name: "j1".into(),
            kind: KIND.into(),
            config: serde_json::json!({
                "input_path": input.to_str().unwrap(),
                "output_path": output.to_str().unwrap(),
            }),
            allocator,
            restart_tx,
            sink: None,
        };
        let attrs = JobTriggerAttributes::parse(&ctx.config).unwrap();
        let core = TriggerCore::new(ctx);
        let trigger = JobTrigger::new(core, attrs, Duration::from_secs(1));

        trigger.start(None).await.unwrap();
        let out = tokio::fs::read_to_string(&output).await.unwrap();
        assert_eq!(out, "Got job text. Job done.");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
