use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::Utc;

use crate::config;
use crate::data::{
    self, InteractionService, MockTaleService, PlatformInteractionService, PlatformTaleService,
    TaleService,
};
use crate::history;
use crate::platform;
use crate::ui;

pub fn run() -> Result<()> {
    let cfg = config::load(config::LoadOptions::default()).context("load config")?;
    let config_path = config::default_path();
    let display_path = friendly_path(config_path.as_ref());

    let store = history::Store::open(history::Options {
        path: cfg.history.path.clone(),
    })
    .context("open history store")?;

    let retention = cfg
        .history
        .retention
        .unwrap_or_else(config::default_history_retention);
    let prune_warning = prune_history(&store, retention);

    let status: String;
    let tales: Arc<dyn TaleService>;
    let interactions: Option<Arc<dyn InteractionService>>;

    match platform::Client::new(platform::ClientConfig {
        base_url: cfg.platform.base_url.clone(),
        user_agent: cfg.platform.user_agent.clone(),
        http_client: None,
    }) {
        Ok(client) => {
            let client = Arc::new(client);
            tales = Arc::new(PlatformTaleService::new(client.clone()));
            interactions = Some(Arc::new(PlatformInteractionService::new(client)));
            status =
                "Browsing Tales. j/k to scroll, Enter to open replies, q to quit.".to_string();
        }
        Err(err) => {
            tales = Arc::new(MockTaleService::sample());
            interactions = Some(Arc::new(data::MockInteractionService::default()));
            status = format!("Offline mode ({err:#}). Showing sample tales.");
        }
    }

    let status = match prune_warning {
        Some(warning) => format!("{status} {warning}"),
        None => status,
    };

    let options = ui::Options {
        status_message: status,
        tales,
        interactions,
        history: Some(store),
        max_window_size: cfg.feed.max_window_size,
        page_cache_size: cfg.feed.page_cache_size,
        config_path: display_path,
    };

    let mut model = ui::Model::new(options);
    model.run()?;

    Ok(())
}

/// Prunes viewed-history rows older than the retention window. Returns a
/// status-line warning instead of failing startup when pruning goes wrong.
fn prune_history(store: &history::Store, retention: std::time::Duration) -> Option<String> {
    let retention = chrono::Duration::from_std(retention).ok()?;
    match store.prune_older_than(Utc::now() - retention) {
        Ok(_) => None,
        Err(err) => Some(format!("History pruning failed: {err:#}")),
    }
}

fn friendly_path(path: Option<&std::path::PathBuf>) -> String {
    if let Some(path) = path {
        if let Some(home) = dirs::home_dir() {
            if let Ok(stripped) = path.strip_prefix(&home) {
                let mut display = String::from("~");
                if !stripped.as_os_str().is_empty() {
                    display.push_str(&format!("/{}", stripped.display()));
                }
                return display;
            }
        }
        path.display().to_string()
    } else {
        "~/.config/tales-tui/config.yaml".to_string()
    }
}
