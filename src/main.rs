use anyhow::{Context, bail};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use sendmill::{MIGRATOR, Settings, init_tracing};

const USAGE: &str = "\
usage: sendmill <command> [options]

commands:
  serve    [--config PATH]              run the platform
  migrate  [--config PATH] --up|--down  apply or revert database migrations
  setup    [--config PATH]              validate config and prepare dependencies
  version                               print the version
";

struct Cli {
    command: String,
    config: Option<PathBuf>,
    up: bool,
    down: bool,
}

fn parse_args() -> Result<Cli, String> {
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        return Err("missing command".to_string());
    };

    let mut cli = Cli {
        command,
        config: None,
        up: false,
        down: false,
    };

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let Some(path) = args.next() else {
                    return Err("--config requires a path".to_string());
                };
                cli.config = Some(PathBuf::from(path));
            }
            "--up" => cli.up = true,
            "--down" => cli.down = true,
            other => return Err(format!("unknown option: {other}")),
        }
    }

    Ok(cli)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE}");
            std::process::exit(1);
        }
    };

    if let Err(err) = dispatch(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command.as_str() {
        "serve" => serve(cli).await,
        "migrate" => migrate(cli).await,
        "setup" => setup(cli).await,
        "version" => {
            println!("sendmill {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => {
            bail!("unknown command: {other}\n\n{USAGE}");
        }
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<Settings> {
    let settings = Settings::load(cli.config.as_deref()).context("could not load configuration")?;
    settings.validate()?;
    Ok(settings)
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(&cli)?;
    init_tracing(&settings.logging);

    sendmill::run(settings, CancellationToken::new()).await
}

async fn migrate(cli: Cli) -> anyhow::Result<()> {
    if cli.up == cli.down {
        bail!("migrate requires exactly one of --up or --down");
    }

    let settings = load_settings(&cli)?;
    init_tracing(&settings.logging);
    let pool = sendmill::connect_pool(&settings).await?;

    if cli.up {
        MIGRATOR.run(&pool).await.context("migration failed")?;
        println!("migrations applied");
    } else {
        MIGRATOR
            .undo(&pool, 0)
            .await
            .context("migration revert failed")?;
        println!("migrations reverted");
    }

    Ok(())
}

/// Validate the configuration and make sure both stores are reachable
/// and migrated, so `serve` starts clean.
async fn setup(cli: Cli) -> anyhow::Result<()> {
    let settings = load_settings(&cli)?;
    init_tracing(&settings.logging);

    let pool = sendmill::connect_pool(&settings).await?;
    MIGRATOR.run(&pool).await.context("migration failed")?;
    println!("database ready");

    let client =
        redis::Client::open(settings.redis.url.as_str()).context("invalid redis url")?;
    let mut connection = redis::aio::ConnectionManager::new(client)
        .await
        .context("failed to connect to redis")?;
    redis::cmd("PING")
        .query_async::<()>(&mut connection)
        .await
        .context("redis did not answer ping")?;
    println!("redis ready");

    println!("setup complete");
    Ok(())
}
