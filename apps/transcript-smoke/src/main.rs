mod config;
mod logging;
mod scenario;

use tracing::{error, info};

use crate::config::SmokeConfig;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(2);
        }
    };
    info!(
        conversation_id = %config.conversation_id,
        messages = config.message_count,
        page_size = config.tuning.page_size,
        viewport_height_px = config.viewport_height_px,
        "starting transcript smoke run"
    );

    match scenario::run(&config).await {
        Ok(report) => {
            info!(?report, "transcript smoke run finished");
            println!(
                "Scrolled through {} older page(s); start of history reached: {}.",
                report.older_pages, report.oldest_reached
            );
            println!(
                "Read up to {}; {} unread message(s) left; {} row(s) on screen at the end.",
                report.marked_read_upto.as_deref().unwrap_or("nothing"),
                report.unseen_after_run,
                report.final_row_count
            );
        }
        Err(err) => {
            error!(error = %err, "transcript smoke run failed");
            eprintln!("Smoke run failed: {err}");
            std::process::exit(1);
        }
    }
}
