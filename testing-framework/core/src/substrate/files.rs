use std::sync::Arc;

use tracing::warn;

use super::{
    engine::{ContainerEngine, ContainerSpec, EngineError},
    labels::{cleanup_labels, random_suffix},
};

/// Image used for single-file access to volumes.
pub const FILE_HELPER_IMAGE: &str = "busybox:stable";
/// Mount point of the target volume inside the helper container.
pub const VOLUME_MOUNT: &str = "/mnt/dockervolume";
const STAGING_PATH: &str = "/tmp/.icfile";

const WRITE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cp /tmp/.icfile "$1" && chown "$(stat -c %u:%g /mnt/dockervolume)" "$1""#;

/// Reads and writes individual files inside a named volume through short-lived
/// helper containers.
#[derive(Clone)]
pub struct VolumeFiles {
    engine: Arc<dyn ContainerEngine>,
    test_name: String,
}

impl VolumeFiles {
    #[must_use]
    pub fn new(engine: Arc<dyn ContainerEngine>, test_name: impl Into<String>) -> Self {
        Self {
            engine,
            test_name: test_name.into(),
        }
    }

    fn helper_spec(&self, role: &str, volume: &str) -> ContainerSpec {
        ContainerSpec {
            name: format!("interchaintest-{role}-{}", random_suffix(8)),
            image: FILE_HELPER_IMAGE.to_owned(),
            binds: vec![format!("{volume}:{VOLUME_MOUNT}")],
            labels: cleanup_labels(&self.test_name),
            user: Some("0".to_owned()),
            ..ContainerSpec::default()
        }
    }

    pub async fn read_file(&self, volume: &str, rel_path: &str) -> Result<Vec<u8>, EngineError> {
        let spec = ContainerSpec {
            cmd: vec!["true".to_owned()],
            ..self.helper_spec("getfile", volume)
        };
        let id = self.engine.create_container(&spec).await?;
        let content = self
            .engine
            .copy_from_container(&id, &volume_path(rel_path))
            .await;
        self.remove_helper(&id).await;
        content
    }

    pub async fn write_file(
        &self,
        volume: &str,
        rel_path: &str,
        content: &[u8],
    ) -> Result<(), EngineError> {
        let target = volume_path(rel_path);
        let spec = ContainerSpec {
            entrypoint: Some(vec![
                "sh".to_owned(),
                "-c".to_owned(),
                WRITE_SCRIPT.to_owned(),
                "_".to_owned(),
            ]),
            cmd: vec![target.clone()],
            ..self.helper_spec("writefile", volume)
        };
        let id = self.engine.create_container(&spec).await?;
        let outcome = self.stage_and_move(&id, content, &target).await;
        self.remove_helper(&id).await;
        outcome
    }

    async fn stage_and_move(
        &self,
        id: &str,
        content: &[u8],
        target: &str,
    ) -> Result<(), EngineError> {
        self.engine
            .copy_to_container(id, STAGING_PATH, content)
            .await?;
        self.engine.start_container(id).await?;
        let status = self.engine.wait_container(id).await?;
        if status == 0 {
            return Ok(());
        }
        let (_, stderr) = self.engine.logs(id, None).await?;
        Err(EngineError::Command {
            command: format!("write {target}"),
            status,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn remove_helper(&self, id: &str) {
        if let Err(err) = self.engine.remove_container(id, true).await {
            if !err.is_not_found() {
                warn!(container = id, error = %err, "failed to remove file helper container");
            }
        }
    }
}

fn volume_path(rel_path: &str) -> String {
    format!("{VOLUME_MOUNT}/{}", rel_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::VolumeFiles;
    use crate::{
        substrate::{ContainerEngine as _, cleanup_labels},
        testing::FakeEngine,
    };

    #[tokio::test]
    async fn written_files_read_back() {
        let engine = Arc::new(FakeEngine::new());
        let volume = engine
            .create_volume(&cleanup_labels("TestFiles"))
            .await
            .expect("volume");
        let files = VolumeFiles::new(engine.clone(), "TestFiles");

        files
            .write_file(&volume, "config/genesis.json", b"{}")
            .await
            .expect("write");
        let content = files
            .read_file(&volume, "/config/genesis.json")
            .await
            .expect("read");

        assert_eq!(content, b"{}");
        assert_eq!(engine.container_count(), 0);
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let engine = Arc::new(FakeEngine::new());
        let volume = engine
            .create_volume(&cleanup_labels("TestFiles"))
            .await
            .expect("volume");
        let files = VolumeFiles::new(engine, "TestFiles");

        let err = files
            .read_file(&volume, "config/missing.json")
            .await
            .expect_err("file is missing");
        assert!(err.is_not_found());
    }
}
