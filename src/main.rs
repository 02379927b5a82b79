use std::sync::{Arc, RwLock};

use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use clap::Parser;
use log::{error, info};
use vhost::vhost_user::Listener;
use vhost_user_backend::VhostUserDaemon;
use vm_memory::{GuestMemoryAtomic, GuestMemoryMmap};
use vmm_sys_util::eventfd::{EFD_NONBLOCK, EventFd};

use virtio_user_block_s3::backend::{VhostUserBlockService, build_virtio_blk_config};
use virtio_user_block_s3::config::ConfigBuilder;
use virtio_user_block_s3::object_store::S3ObjectStore;
use virtio_user_block_s3::session::Session;

/// Serve a bucket (or a single object within one) as a virtio-blk device over a
/// vhost-user socket. Configuration beyond bucket/key is given as `key=value`
/// pairs, mirroring how the plugin this is modeled on takes its parameters.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the vhost-user listening socket.
    socket: String,

    /// `key=value` configuration pairs: access-key, secret-key, session-token,
    /// endpoint-url, bucket, key, size, object-size.
    params: Vec<String>,
}

fn build_config(params: &[String]) -> virtio_user_block_s3::config::Config {
    let mut builder = ConfigBuilder::new();
    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            error!("malformed parameter {param:?}, expected key=value");
            std::process::exit(1);
        };
        if let Err(e) = builder.set(key, value) {
            error!("bad configuration: {e}");
            std::process::exit(1);
        }
    }
    match builder.build() {
        Ok(config) => config,
        Err(e) => {
            error!("bad configuration: {e}");
            std::process::exit(1);
        }
    }
}

async fn build_s3_client(config: &virtio_user_block_s3::config::Config) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(endpoint_url) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }
    if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
        let creds = Credentials::new(
            access_key,
            secret_key,
            config.session_token.clone(),
            None,
            "virtio-user-block-s3",
        );
        loader = loader.credentials_provider(creds);
    }
    let sdk_config = loader.load().await;
    aws_sdk_s3::Client::new(&sdk_config)
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let config = build_config(&args.params);
    info!(
        "serving bucket={} key={} mode={}",
        config.bucket,
        config.key,
        if config.is_multi_object() { "multi-object" } else { "single-object read-only" }
    );

    let client = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build startup Tokio runtime")
        .block_on(build_s3_client(&config));

    let store = S3ObjectStore::new(client, config.bucket.clone());
    let virtio_config = build_virtio_blk_config(&config);
    let session = Arc::new(Session::new(config, store));

    let mem = GuestMemoryAtomic::new(GuestMemoryMmap::new());
    let backend = Arc::new(RwLock::new(VhostUserBlockService::new(
        mem.clone(),
        EventFd::new(EFD_NONBLOCK).unwrap(),
        session,
        virtio_config,
    )));

    info!("listening on {}", args.socket);
    let listener = Listener::new(&args.socket, true).unwrap();

    let name = "virtio-user-block-s3";
    let mut daemon = VhostUserDaemon::new(name.to_string(), backend, mem).unwrap();

    if let Err(e) = daemon.start(listener) {
        error!("Failed to start daemon: {:?}\n", e);
        std::process::exit(1);
    }

    if let Err(e) = daemon.wait() {
        error!("Error from the main thread: {:?}", e);
    }
}
