use std::sync::Arc;

use super::{
    engine::{ContainerEngine, EngineError},
    image::{Image, JobOptions},
};

const OWNER_SCRIPT: &str = r#"chown "$2" "$1" && chmod 0700 "$1""#;
const OWNER_MOUNT: &str = "/mnt/dockervolume";

#[derive(Clone, Debug)]
pub struct VolumeOwnerOptions {
    pub test_name: String,
    pub volume: String,
    /// Image whose user will run the node; the job runs it as root.
    pub image_ref: String,
    pub uid_gid: String,
}

/// Hands a freshly created volume to the image's `uid:gid`.
pub async fn set_volume_owner(
    engine: Arc<dyn ContainerEngine>,
    network_id: &str,
    opts: &VolumeOwnerOptions,
) -> Result<(), EngineError> {
    if opts.uid_gid.is_empty() {
        return Ok(());
    }

    let image = Image::new(engine, &opts.test_name, network_id, &opts.image_ref, "");
    let cmd = vec![OWNER_MOUNT.to_owned(), opts.uid_gid.clone()];
    image
        .run_checked(
            "volume-owner",
            &cmd,
            &JobOptions {
                binds: vec![format!("{}:{OWNER_MOUNT}", opts.volume)],
                user: Some("0".to_owned()),
                entrypoint: Some(vec![
                    "sh".to_owned(),
                    "-c".to_owned(),
                    OWNER_SCRIPT.to_owned(),
                    "_".to_owned(),
                ]),
                ..JobOptions::default()
            },
        )
        .await
        .map(|_| ())
}
