mod app;
mod completion;
mod concierge;
mod config;
mod escalation;
mod identity;
mod notify;
mod prompting;
mod reservation_notify;
mod store;
mod types;

#[tokio::main]
async fn main() {
    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "concierge server stopped");
        eprintln!("concierge-server: {err}");
        std::process::exit(1);
    }
}
