use std::sync::Arc;

use tracing::{debug, warn};

use super::{
    engine::{ContainerEngine, ContainerSpec, EngineError, ExecOutput},
    labels::{cleanup_labels, random_suffix, sanitize_name},
};

/// Per-job container settings.
#[derive(Clone, Debug, Default)]
pub struct JobOptions {
    pub binds: Vec<String>,
    pub env: Vec<String>,
    /// Overrides the image's `uid:gid`.
    pub user: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub working_dir: Option<String>,
}

/// Runs one-shot commands in throwaway containers of a single image, attached
/// to the test network and labelled for cleanup.
#[derive(Clone)]
pub struct Image {
    engine: Arc<dyn ContainerEngine>,
    test_name: String,
    network_id: String,
    image_ref: String,
    uid_gid: String,
}

impl Image {
    #[must_use]
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        test_name: impl Into<String>,
        network_id: impl Into<String>,
        image_ref: impl Into<String>,
        uid_gid: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            test_name: test_name.into(),
            network_id: network_id.into(),
            image_ref: image_ref.into(),
            uid_gid: uid_gid.into(),
        }
    }

    #[must_use]
    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    /// Creates, starts and waits for a job container, then removes it. The
    /// exit code is reported, not checked; see [`ExecOutput::ensure_success`].
    pub async fn run(
        &self,
        job_name: &str,
        cmd: &[String],
        options: &JobOptions,
    ) -> Result<ExecOutput, EngineError> {
        let name = format!("{}-{}", sanitize_name(job_name), random_suffix(6));
        let user = options
            .user
            .clone()
            .or_else(|| (!self.uid_gid.is_empty()).then(|| self.uid_gid.clone()));
        let spec = ContainerSpec {
            name: name.clone(),
            image: self.image_ref.clone(),
            cmd: cmd.to_vec(),
            entrypoint: options.entrypoint.clone(),
            env: options.env.clone(),
            user,
            hostname: Some(name.clone()),
            network_id: (!self.network_id.is_empty()).then(|| self.network_id.clone()),
            binds: options.binds.clone(),
            labels: cleanup_labels(&self.test_name),
            working_dir: options.working_dir.clone(),
            ..ContainerSpec::default()
        };

        debug!(job = %name, image = %self.image_ref, command = ?cmd, "running job container");
        let id = self.engine.create_container(&spec).await?;
        let outcome = self.run_created(&id).await;

        if let Err(err) = self.engine.remove_container(&id, true).await {
            if !err.is_not_found() {
                warn!(job = %name, error = %err, "failed to remove job container");
            }
        }

        outcome
    }

    async fn run_created(&self, id: &str) -> Result<ExecOutput, EngineError> {
        self.engine.start_container(id).await?;
        let exit_code = self.engine.wait_container(id).await?;
        let (stdout, stderr) = self.engine.logs(id, None).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// [`Self::run`] followed by [`ExecOutput::ensure_success`].
    pub async fn run_checked(
        &self,
        job_name: &str,
        cmd: &[String],
        options: &JobOptions,
    ) -> Result<ExecOutput, EngineError> {
        self.run(job_name, cmd, options).await?.ensure_success(cmd)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{Image, JobOptions};
    use crate::{substrate::CLEANUP_LABEL, testing::FakeEngine};

    #[tokio::test]
    async fn job_containers_are_labelled_and_removed() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_job("echo", 0, b"hello\n", b"");
        let image = Image::new(engine.clone(), "TestJobs", "net", "busybox:stable", "1000:1000");

        let cmd = vec!["echo".to_owned(), "hello".to_owned()];
        let output = image
            .run_checked("echo-job", &cmd, &JobOptions::default())
            .await
            .expect("job succeeds");

        assert_eq!(output.stdout_string(), "hello\n");
        let created = engine.created_specs();
        assert_eq!(created.len(), 1);
        assert_eq!(
            created[0].labels.get(CLEANUP_LABEL).map(String::as_str),
            Some("TestJobs")
        );
        assert_eq!(created[0].user.as_deref(), Some("1000:1000"));
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let engine = Arc::new(FakeEngine::new());
        engine.script_job("false", 3, b"", b"nope");
        let image = Image::new(engine, "TestJobs", "net", "busybox:stable", "");

        let err = image
            .run_checked("fail", &["false".to_owned()], &JobOptions::default())
            .await
            .expect_err("job fails");

        assert!(err.to_string().contains("nope"));
        assert!(err.to_string().contains("status 3"));
    }
}
