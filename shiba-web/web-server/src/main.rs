use anyhow::Context;
use common::config::Config;
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use std::{io::ErrorKind, path::PathBuf};
use tokio::fs::{self, File};

use actix_web::{
    App as ActixApp, HttpServer,
    middleware::{self, Logger},
    web::{Data, scope},
};
use log::{Level, error, info};
use simplelog::{ColorChoice, CombinedLogger, SharedLogger, TermLogger, TerminalMode, WriteLogger};

use crate::{
    api::api_service,
    app::App,
    cli::{Cli, Command},
};

mod api;
mod app;
mod connection;
mod fanout;
mod relay;
mod room;

mod cli;

#[cfg(test)]
mod test_support;

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::load();

    let config = load_config(&cli).await?;

    match cli.command {
        Some(Command::PrintConfig) => {
            let json = serde_json::to_string_pretty(&config)
                .context("failed to serialize config to json")?;
            println!("{json}");
            return Ok(());
        }
        None | Some(Command::Run) => {
            // Fallthrough
        }
    }

    init_logging(&config).await?;

    start(config).await.inspect_err(|err| error!("{err:?}"))
}

/// Reads the config, or writes the default one when the file doesn't exist yet
async fn load_config(cli: &Cli) -> Result<Config, anyhow::Error> {
    let config_path = PathBuf::from(&cli.config_path);

    match fs::read_to_string(&config_path).await {
        Ok(value) => {
            let mut config: Config = serde_json::from_str(&value)
                .with_context(|| format!("invalid config file {config_path:?}"))?;
            cli.options.apply(&mut config);
            Ok(config)
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let mut new_config = Config::default();
            cli.options.apply(&mut new_config);

            let value_str = serde_json::to_string_pretty(&new_config)
                .context("failed to serialize default config")?;

            if let Some(parent) = config_path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create directories for {config_path:?}"))?;
            }
            fs::write(&config_path, value_str)
                .await
                .with_context(|| format!("failed to write default config to {config_path:?}"))?;

            Ok(new_config)
        }
        Err(err) => {
            Err(err).with_context(|| format!("failed to read config file {config_path:?}"))
        }
    }
}

async fn init_logging(config: &Config) -> Result<(), anyhow::Error> {
    let log_config = simplelog::ConfigBuilder::new()
        .add_filter_ignore_str("actix_http::h1")
        .add_filter_ignore_str("webrtc_sctp")
        .build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![TermLogger::new(
        config.log.level_filter,
        log_config.clone(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )];

    if let Some(file_path) = &config.log.file_path {
        let file = File::create(file_path)
            .await
            .with_context(|| format!("failed to open log file {file_path}"))?;

        loggers.push(WriteLogger::new(
            config.log.level_filter,
            log_config,
            file.into_std().await,
        ));
    }

    CombinedLogger::init(loggers).context("failed to init combined logger")?;

    Ok(())
}

async fn start(config: Config) -> Result<(), anyhow::Error> {
    let app = App::new(config.clone()).await?;
    let app = Data::new(app);

    let bind_address = app.config().web_server.bind_address;
    let server = HttpServer::new({
        let url_path_prefix = config.web_server.url_path_prefix.clone();
        let allowed_origin = config.web_server.allowed_origin.clone();
        let app = app.clone();

        move || {
            let mut headers = middleware::DefaultHeaders::new()
                .add((
                    "Cache-Control",
                    "no-store, no-cache, must-revalidate, private",
                ))
                .add(("Pragma", "no-cache"))
                .add(("Expires", "0"));

            if let Some(origin) = &allowed_origin {
                headers = headers
                    .add(("Access-Control-Allow-Origin", origin.clone()))
                    .add(("Access-Control-Allow-Credentials", "true"));
            }

            ActixApp::new().service(
                scope(&url_path_prefix)
                    .app_data(app.clone())
                    .wrap(
                        Logger::new("%r took %D ms")
                            .log_target("http_server")
                            .log_level(Level::Debug),
                    )
                    .wrap(headers)
                    .service(api_service()),
            )
        }
    });

    if let Some(certificate) = app.config().web_server.certificate.as_ref() {
        info!("[Server]: Running Https Server with ssl tls");

        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
            .context("failed to create ssl tls acceptor")?;
        builder
            .set_private_key_file(&certificate.private_key_pem, SslFiletype::PEM)
            .context("failed to set private key")?;
        builder
            .set_certificate_chain_file(&certificate.certificate_pem)
            .context("failed to set certificate")?;

        server.bind_openssl(bind_address, builder)?.run().await?;
    } else {
        info!("[Server]: Listening on {bind_address}");
        server.bind(bind_address)?.run().await?;
    }

    Ok(())
}
