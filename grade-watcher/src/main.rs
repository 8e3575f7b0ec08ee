use std::{path::PathBuf, sync::Arc};

use actix_web::{middleware::Logger, web, App, HttpServer, Responder};
use anyhow::{anyhow, Context};
use clap::Parser;
use grade_monitor::{
    browser::ChromeBrowser,
    captcha::TwoCaptchaSolver,
    portal::Services,
    store::{JsonConfigStore, SharedConfig, UserId},
    transport::ReqwestConnector,
};
use grade_monitor_utils::fs_json_util::read_toml;
use grade_watcher::{
    commands::{self, Request},
    discord::Discord,
    scheduler::Scheduler,
    settings::Settings,
};
use log::{error, info};
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr};
use tokio::sync::{mpsc, oneshot};

#[derive(Parser)]
struct Opts {
    #[arg(default_value = "ignore/grade-watcher.toml")]
    settings_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();
    let settings: Settings = read_toml(&opts.settings_path)?;
    let port = settings.port;
    let route = settings.command_endpoint.clone();

    let config = SharedConfig::open(JsonConfigStore::new(&settings.config_path))?;
    let services = Services::new(
        settings.portal,
        config,
        ReqwestConnector,
        ChromeBrowser::new(settings.browser),
        TwoCaptchaSolver::new(settings.captcha)?,
    );
    let messenger = Arc::new(Discord::new(&settings.bot_token, settings.discord_api)?);

    let (requests, receiver) = mpsc::channel(64);
    let scheduler = tokio::spawn(Scheduler::new(services, messenger).run(receiver));

    info!("Listening for commands at {route} on port {port}");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(State {
                requests: requests.clone(),
            }))
            .route(&route, web::post().to(command))
            .wrap(Logger::default())
    })
    .bind(("0.0.0.0", port))?
    .run();

    tokio::select! {
        result = server => result?,
        result = scheduler => result??,
    }
    info!("Shutting down");

    Ok(())
}

struct State {
    requests: mpsc::Sender<Request>,
}

#[serde_as]
#[derive(Deserialize)]
struct SlashCommand {
    #[serde_as(as = "DisplayFromStr")]
    user_id: UserId,
    text: String,
}

async fn command(state: web::Data<State>, info: web::Form<SlashCommand>) -> impl Responder {
    match command_impl(&state, info.into_inner()).await {
        Ok(answer) => answer,
        Err(e) => {
            error!("{e:#}");
            e.to_string()
        }
    }
}

async fn command_impl(state: &State, info: SlashCommand) -> anyhow::Result<String> {
    // The rest of the text may hold a password.
    let name = info.text.split_whitespace().next().unwrap_or_default();
    info!("{}: Slash command {name:?}", info.user_id);

    let command = commands::parse(&info.text)?;
    let (reply, answer) = oneshot::channel();
    state
        .requests
        .send(Request {
            user_id: info.user_id,
            command,
            reply,
        })
        .await
        .map_err(|_| anyhow!("The scheduler has stopped"))?;
    answer.await.context("The scheduler dropped the command")
}
