//! Thin layer over a container engine plus the harness conventions built on
//! it: cleanup labels, host-port reservation, one-shot job containers, volume
//! file access and ownership, per-test networks and the label sweep.

mod cleanup;
mod engine;
mod files;
mod image;
mod labels;
mod network;
mod ports;
mod volume;

pub use cleanup::{SweepReport, sweep};
pub use engine::{
    ContainerEngine, ContainerSpec, ContainerState, ContainerSummary, EngineError, ExecOutput,
    HostBinding, LabelFilter, Labels, NetworkSummary, PortBinding, host_port,
};
pub use files::{FILE_HELPER_IMAGE, VOLUME_MOUNT, VolumeFiles};
pub use image::{Image, JobOptions};
pub use labels::{
    CLEANUP_LABEL, NODE_OWNER_LABEL, cleanup_filter, cleanup_labels, condense_hostname, node_labels,
    random_suffix, sanitize_name,
};
pub use network::{TestNetwork, create_network};
pub use ports::{PortReservation, reserve_ports, start_guard, tcp_port};
pub use volume::{VolumeOwnerOptions, set_volume_owner};
