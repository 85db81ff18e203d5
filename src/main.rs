mod client;
mod controller;
mod decoder;
mod protocol;
mod transcript;
mod ui;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use client::AgentClient;
use controller::ChatController;
use transcript::Speaker;

/// Operator console for the ticket-routing agent.
#[derive(Debug, Parser)]
#[command(name = "routedesk", version)]
struct Cli {
    /// Base URL of the routing backend.
    #[arg(long, env = "ROUTEDESK_BASE_URL", default_value = "http://127.0.0.1:8000")]
    base_url: String,

    /// Dataset session id returned by the CSV upload; omit to run the agent
    /// without data.
    #[arg(long, env = "ROUTEDESK_SESSION_ID")]
    session_id: Option<String>,

    /// Ask one question, print the answer, and exit.
    #[arg(long, value_name = "QUESTION")]
    ask: Option<String>,

    /// With --ask, use the non-streaming endpoint instead of the event stream.
    #[arg(long, requires = "ask")]
    no_stream: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = AgentClient::new(&cli.base_url);
    tracing::debug!(base_url = %client.base_url(), session_id = ?cli.session_id, "starting routedesk");
    let mut controller = ChatController::new(client, cli.session_id);

    if let Some(question) = cli.ask {
        if cli.no_stream {
            controller.ask_once(&question).await;
        } else {
            controller.submit(&question);
            controller.run_until_idle().await;
        }
        for turn in controller.turns() {
            if turn.speaker != Speaker::Assistant {
                continue;
            }
            println!("{}", turn.text);
            if let Some(viz) = &turn.visualization {
                println!("[{}]", viz.describe());
            }
        }
        return Ok(());
    }

    ui::run_console(controller)
}
