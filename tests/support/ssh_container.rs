// ABOUTME: Disposable OpenSSH server for integration tests.
// ABOUTME: One password-login container per test binary, published on a Docker-assigned loopback port.

use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use futures::TryStreamExt;
use sshot::ssh::{ConnectionParameters, HostKeyPolicy};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::AsyncReadExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const IMAGE: &str = "lscr.io/linuxserver/openssh-server:latest";
const SSHD_PORT: &str = "2222/tcp";
pub const TEST_USER: &str = "testuser";
pub const TEST_PASSWORD: &str = "sshot-test-password";

static CONTAINER_ID: OnceLock<String> = OnceLock::new();
static SERVER: tokio::sync::OnceCell<SshContainer> = tokio::sync::OnceCell::const_new();

#[ctor::dtor]
fn remove_on_exit() {
    let Some(id) = CONTAINER_ID.get() else {
        return;
    };
    let Ok(rt) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        return;
    };
    rt.block_on(async {
        if let Ok(docker) = Docker::connect_with_local_defaults() {
            let force = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            let _ = docker.remove_container(id, Some(force)).await;
        }
    });
}

/// The server shared by every test in this binary, started on first use.
pub async fn shared_container() -> &'static SshContainer {
    SERVER
        .get_or_init(|| async { SshContainer::start().await.expect("SSH test server did not start") })
        .await
}

pub struct SshContainer {
    port: u16,
}

impl SshContainer {
    async fn start() -> Result<Self, BoxError> {
        let docker = Docker::connect_with_local_defaults()?;

        let pull = CreateImageOptions {
            from_image: Some(IMAGE.to_string()),
            ..Default::default()
        };
        docker
            .create_image(Some(pull), None, None)
            .try_collect::<Vec<_>>()
            .await?;

        let id = docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(format!("sshot-test-{}", std::process::id())),
                    ..Default::default()
                }),
                password_server(),
            )
            .await?
            .id;
        let _ = CONTAINER_ID.set(id.clone());

        docker
            .start_container(&id, None::<StartContainerOptions>)
            .await?;

        let port = published_port(&docker, &id).await?;
        await_banner(port).await?;
        Ok(Self { port })
    }

    /// Password login to this server, host key unchecked.
    pub fn params(&self) -> ConnectionParameters {
        ConnectionParameters::new("127.0.0.1", TEST_USER, HostKeyPolicy::AcceptAny)
            .port(self.port)
            .password(TEST_PASSWORD)
    }
}

fn password_server() -> ContainerCreateBody {
    let env = [
        "PUID=1000".to_string(),
        "PGID=1000".to_string(),
        "PASSWORD_ACCESS=true".to_string(),
        format!("USER_NAME={TEST_USER}"),
        format!("USER_PASSWORD={TEST_PASSWORD}"),
    ];
    // No host port: Docker picks a free one, read back after start.
    let loopback = PortBinding {
        host_ip: Some("127.0.0.1".to_string()),
        host_port: None,
    };
    ContainerCreateBody {
        image: Some(IMAGE.to_string()),
        env: Some(env.to_vec()),
        host_config: Some(HostConfig {
            port_bindings: Some([(SSHD_PORT.to_string(), Some(vec![loopback]))].into()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn published_port(docker: &Docker, id: &str) -> Result<u16, BoxError> {
    let details = docker
        .inspect_container(id, None::<InspectContainerOptions>)
        .await?;
    details
        .network_settings
        .and_then(|settings| settings.ports)
        .and_then(|mut ports| ports.remove(SSHD_PORT))
        .flatten()
        .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
        .ok_or("sshd port was not published")?
        .parse()
        .map_err(Into::into)
}

/// Poll until sshd answers with its version banner.
async fn await_banner(port: u16) -> Result<(), BoxError> {
    for _ in 0..60 {
        if let Ok(mut conn) = tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            let mut banner = [0u8; 4];
            let read = tokio::time::timeout(Duration::from_secs(2), conn.read_exact(&mut banner)).await;
            if matches!(read, Ok(Ok(_))) && &banner == b"SSH-" {
                // sshd accepts before the container finishes creating the user
                tokio::time::sleep(Duration::from_secs(1)).await;
                return Ok(());
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Err(format!("no SSH banner on port {port}").into())
}
