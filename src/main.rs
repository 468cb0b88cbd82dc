//! Local sandbox: one scene, one token, the full request/response loop.
//!
//! Boots an in-memory scene with a single token, starts the synchronizer
//! and the action service, then drives add/remove calls through the
//! protocol client and prints the resulting markers and labels as JSON.

use std::sync::Arc;

use clap::Parser;
use condition_markers::bus::{BusError, LocalBus};
use condition_markers::config::MarkerConfig;
use condition_markers::scene::{
    ImageContent, ImageGrid, ImageInfo, ItemContent, ItemMetadata, Layer, LocalPlayer, MemoryScene, SceneItem,
    SceneStore, StoreError, Vector2,
};
use condition_markers::services::api::ActionService;
use condition_markers::services::client::{ActionClient, ClientError};
use condition_markers::services::label::LabelManager;
use condition_markers::services::sync::MarkerSync;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum SandboxError {
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "condition-markers", about = "Condition marker sandbox")]
struct Cli {
    /// Scene grid resolution in pixels per cell.
    #[arg(long, env = "CONDITION_MARKERS_GRID_DPI", default_value_t = 150.0)]
    grid_dpi: f64,

    #[arg(long, default_value_t = 100.0)]
    x: f64,

    #[arg(long, default_value_t = 100.0)]
    y: f64,

    /// Negative values mirror the token.
    #[arg(long, default_value_t = 1.0, allow_hyphen_values = true)]
    scale_x: f64,

    #[arg(long, default_value_t = 1.0, allow_hyphen_values = true)]
    scale_y: f64,

    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    rotation: f64,

    /// Condition to add. Repeatable.
    #[arg(long = "add", value_name = "CONDITION")]
    add: Vec<String>,

    /// Condition to remove after all adds. Repeatable.
    #[arg(long = "remove", value_name = "CONDITION")]
    remove: Vec<String>,

    /// Label text attached to every added marker.
    #[arg(long)]
    label: Option<String>,
}

fn sandbox_token(cli: &Cli) -> SceneItem {
    SceneItem {
        id: Uuid::new_v4(),
        name: "Sandbox Token".into(),
        layer: Layer::Character,
        position: Vector2::new(cli.x, cli.y),
        rotation: cli.rotation,
        scale: Vector2::new(cli.scale_x, cli.scale_y),
        visible: true,
        locked: false,
        attached_to: None,
        disable_attachment_behavior: Vec::new(),
        content: ItemContent::Image(ImageContent {
            image: ImageInfo {
                width: cli.grid_dpi,
                height: cli.grid_dpi,
                mime: "image/png".into(),
                url: "sandbox://token.png".into(),
            },
            grid: ImageGrid { offset: Vector2::new(cli.grid_dpi / 2.0, cli.grid_dpi / 2.0), dpi: cli.grid_dpi },
        }),
        metadata: ItemMetadata::default(),
    }
}

#[tokio::main]
async fn main() -> Result<(), SandboxError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = MarkerConfig::from_env();

    let scene = Arc::new(MemoryScene::new(cli.grid_dpi));
    let bus = Arc::new(LocalBus::new());
    let player = Arc::new(LocalPlayer::new(format!("sandbox-{}", Uuid::new_v4())));

    let token = sandbox_token(&cli);
    let token_id = token.id.to_string();
    scene.seed(vec![token]).await;

    let mut sync = MarkerSync::new(scene.clone());
    sync.start();

    let labels = LabelManager::new(scene.clone(), player.clone());
    let mut service = ActionService::new(scene.clone(), bus.clone(), labels, config.clone());
    service.start()?;

    let mut client = ActionClient::start(bus.clone(), player.as_ref(), config).await?;

    for condition in &cli.add {
        let response = client
            .add_condition(&token_id, condition, cli.label.as_deref())
            .await?;
        if response.ok {
            info!(condition = condition.as_str(), already_present = ?response.already_present, "sandbox: added");
        } else {
            warn!(condition = condition.as_str(), error = ?response.error, "sandbox: add failed");
        }
    }
    for condition in &cli.remove {
        let response = client.remove_condition(&token_id, condition).await?;
        info!(condition = condition.as_str(), deleted = ?response.deleted, ok = response.ok, "sandbox: removed");
    }

    let overlays = scene
        .query(&|item: &SceneItem| item.attached_to.is_some())
        .await?;
    println!("{}", serde_json::to_string_pretty(&overlays)?);

    client.stop();
    service.stop();
    sync.stop();
    Ok(())
}
