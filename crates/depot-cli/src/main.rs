use std::{env, path::PathBuf, sync::Arc};

use clap::Parser;
use cli::{Args, Commands};
use depot_config::config::{config_path, generate_default_config, Config};
use depot_core::{ErrorContext, NullIndexer, Result, StorageHandler};
use fetch::fetch_tarball;
use logging::setup_logging;
use package::{list_local, publish_package, remove_package, set_tag, show_package, unpublish_version};
use search::search_packages;
use tracing::{debug, info};
use utils::set_color;

mod cli;
mod fetch;
mod logging;
mod package;
mod search;
mod utils;

fn resolve_config_path(args: &Args) -> Result<PathBuf> {
    let Some(path) = args.config.as_deref() else {
        return Ok(config_path());
    };
    let path = PathBuf::from(path);
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(env::current_dir()
        .with_context(|| "retrieving current directory".into())?
        .join(path))
}

async fn handle_cli() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args);

    if args.no_color {
        set_color(false);
    }

    let config_path = resolve_config_path(&args)?;

    if let Commands::DefConfig = args.command {
        generate_default_config(&config_path)?;
        return Ok(());
    }

    let mut config = Config::load(&config_path)?;
    if let Some(proxy) = args.proxy {
        config.http_proxy = Some(proxy);
    }
    if let Some(user_agent) = args.user_agent {
        config.user_agent = Some(user_agent);
    }

    if let Commands::Config = args.command {
        info!("{}", config.to_toml()?);
        return Ok(());
    }

    let handler = StorageHandler::from_config(&config, Arc::new(NullIndexer)).await?;
    debug!(config = %config_path.display(), "using configuration");

    match args.command {
        Commands::Info {
            name,
            offline,
            keep_uplinks,
            raw,
        } => show_package(&handler, name, offline, keep_uplinks, raw).await?,
        Commands::Fetch {
            name,
            filename,
            output,
        } => fetch_tarball(&handler, &name, &filename, output).await?,
        Commands::Search {
            query,
            since,
            local,
            limit,
        } => search_packages(&handler, query, since, local, limit).await?,
        Commands::Local => list_local(&handler).await?,
        Commands::Publish {
            manifest,
            tarball,
        } => {
            publish_package(
                &handler,
                &PathBuf::from(manifest),
                tarball.map(PathBuf::from).as_deref(),
            )
            .await?
        }
        Commands::Tag {
            name,
            tag,
            version,
        } => set_tag(&handler, &name, tag, version).await?,
        Commands::Unpublish {
            name,
            version,
        } => unpublish_version(&handler, &name, &version).await?,
        Commands::Remove {
            name,
        } => remove_package(&handler, &name).await?,
        Commands::Config | Commands::DefConfig => {}
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    if let Err(err) = handle_cli().await {
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(1);
    }
}
