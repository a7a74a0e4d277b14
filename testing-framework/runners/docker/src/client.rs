use std::time::Duration;

use bollard::{Docker, errors::Error as DockerError};
use interchaintest_core::substrate::EngineError;

const DEFAULT_PULL_TIMEOUT: Duration = Duration::from_secs(600);

/// A connection to the local Docker daemon. Cloning shares the underlying
/// HTTP client, so one value serves every task of a test.
#[derive(Clone, Debug)]
pub struct DockerEngine {
    pub(crate) docker: Docker,
    pub(crate) pull_timeout: Duration,
}

impl DockerEngine {
    /// Connects through `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, EngineError> {
        Docker::connect_with_local_defaults()
            .map(Self::with_client)
            .map_err(|err| api_error("connect to docker", None, err))
    }

    #[must_use]
    pub const fn with_client(docker: Docker) -> Self {
        Self {
            docker,
            pull_timeout: DEFAULT_PULL_TIMEOUT,
        }
    }

    #[must_use]
    pub const fn with_pull_timeout(mut self, timeout: Duration) -> Self {
        self.pull_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn client(&self) -> &Docker {
        &self.docker
    }
}

/// The resource a request was about, used to classify daemon errors.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Resource<'a> {
    pub kind: &'static str,
    pub id: &'a str,
}

impl<'a> Resource<'a> {
    pub(crate) const fn container(id: &'a str) -> Self {
        Self {
            kind: "container",
            id,
        }
    }

    pub(crate) const fn volume(id: &'a str) -> Self {
        Self { kind: "volume", id }
    }

    pub(crate) const fn network(id: &'a str) -> Self {
        Self {
            kind: "network",
            id,
        }
    }

    pub(crate) const fn image(id: &'a str) -> Self {
        Self { kind: "image", id }
    }
}

/// Maps daemon responses onto the engine error kinds callers branch on.
pub(crate) fn api_error(
    context: &str,
    resource: Option<Resource<'_>>,
    err: DockerError,
) -> EngineError {
    match (err, resource) {
        (DockerError::DockerResponseServerError { status_code: 404, .. }, Some(resource)) => {
            EngineError::NotFound {
                kind: resource.kind,
                id: resource.id.to_owned(),
            }
        }
        (
            DockerError::DockerResponseServerError {
                status_code,
                message,
            },
            Some(resource),
        ) if status_code == 409 || message.contains("active endpoints") => EngineError::Conflict {
            kind: resource.kind,
            id: resource.id.to_owned(),
            message,
        },
        (
            DockerError::DockerResponseServerError {
                status_code,
                message,
            },
            _,
        ) => EngineError::Api {
            context: context.to_owned(),
            status: Some(status_code),
            message,
        },
        (other, _) => EngineError::Api {
            context: context.to_owned(),
            status: None,
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use bollard::errors::Error as DockerError;
    use interchaintest_core::substrate::EngineError;

    use super::{Resource, api_error};

    fn response(status_code: u16, message: &str) -> DockerError {
        DockerError::DockerResponseServerError {
            status_code,
            message: message.to_owned(),
        }
    }

    #[test]
    fn daemon_responses_map_to_error_kinds() {
        let err = api_error(
            "remove container",
            Some(Resource::container("abc")),
            response(404, "No such container: abc"),
        );
        assert!(matches!(err, EngineError::NotFound { kind: "container", ref id } if id == "abc"));

        let err = api_error(
            "remove network",
            Some(Resource::network("net1")),
            response(403, "error while removing network: network net1 has active endpoints"),
        );
        assert!(err.is_conflict());

        let err = api_error(
            "remove volume",
            Some(Resource::volume("v1")),
            response(409, "remove v1: volume is in use"),
        );
        assert!(matches!(err, EngineError::Conflict { kind: "volume", .. }));

        let err = api_error(
            "start container",
            Some(Resource::container("abc")),
            response(500, "port is already allocated"),
        );
        assert!(matches!(err, EngineError::Api { status: Some(500), .. }));
    }

    #[test]
    fn missing_resources_need_a_resource_to_be_not_found() {
        let err = api_error("list networks", None, response(404, "page not found"));
        assert!(!err.is_not_found());
        assert_eq!(err.to_string(), "list networks failed: page not found");
    }
}
