use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "linkctl")]
#[command(about = "Inspect a running device link through its admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    #[arg(short, long, default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Service summary: devices, connection counts, open breakers
    Status,
    /// Connection state for every device, or one device
    Connections {
        /// Device id
        device: Option<String>,
    },
    /// Circuit breaker states and rolling-window stats
    Breakers,
    /// Latest health snapshot
    Health,
    /// Run a health check pass now and print its results
    HealthRun,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string()),
        Commands::Connections { device: None } => (Method::GET, "/admin/connections".to_string()),
        Commands::Connections { device: Some(id) } => (Method::GET, format!("/admin/connections/{}", id)),
        Commands::Breakers => (Method::GET, "/admin/breakers".to_string()),
        Commands::Health => (Method::GET, "/admin/health".to_string()),
        Commands::HealthRun => (Method::POST, "/admin/health/run".to_string()),
    };

    let url = format!("{}{}", cli.url.trim_end_matches('/'), path);
    let res = client.request(method, url).headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
