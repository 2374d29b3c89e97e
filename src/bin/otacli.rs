/*!
# OTA Gateway Command Line Interface

A binary for managing firmware and uploads on a running gateway.

## Usage

```bash
otacli help [subcommand]
```

## Available subcommands

**firmwares** lists the firmware catalog

**boards** lists supported boards and their invitation ports

**publish** stores a firmware binary

**delete** removes a firmware and its binary

**flash** uploads a firmware to one or more devices

**uploads** lists uploads in progress

**abort** aborts an upload

**watch** follows progress events as they happen

## Example

```bash
otacli publish --board esp32 --type app --version 1.2.0 --file build/app.bin
otacli flash --firmware 0d4c7c5e-5a43-4b52-a1a4-53b5c2b1f7de --device kitchen-sensor --device 192.168.1.41
otacli --url http://gateway.local:8080 watch
```

## Dev

To run from source:

```bash
cargo run --bin otacli -- firmwares
```
*/
use std::collections::BTreeMap;
use std::fs;

use clap::{App, AppSettings, Arg, ArgMatches};
use futures::StreamExt;
use ota_gateway::boards::BoardInfo;
use ota_gateway::firmware::FirmwareInfo;
use ota_gateway::networking::handlers::{ErrorBody, UploadOutcome, UploadRequest};
use ota_gateway::ota::orchestrator::RunningUpload;
use ota_gateway::progress::ProgressEvent;
use ota_gateway::time::{create_timestamp, format_timestamp};
use reqwest::{Client, Response};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;
use uuid::Uuid;

#[tokio::main]
pub async fn main() -> ota_gateway::Result<()> {
    let command_matches = App::new("OTA Gateway Command Line Interface")
        .about("Manage firmware and uploads of an OTA gateway")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("url")
                .short("u")
                .long("url")
                .default_value("http://127.0.0.1:8080")
                .takes_value(true)
                .global(true)
                .help("base url of the gateway"),
        )
        .subcommand(App::new("firmwares").about("lists the firmware catalog"))
        .subcommand(App::new("boards").about("lists supported boards"))
        .subcommand(
            App::new("publish")
                .about("stores a firmware binary")
                .arg(
                    Arg::with_name("board")
                        .short("b")
                        .long("board")
                        .required(true)
                        .takes_value(true)
                        .help("board the firmware is built for"),
                )
                .arg(
                    Arg::with_name("type")
                        .short("t")
                        .long("type")
                        .required(true)
                        .takes_value(true)
                        .help("firmware type"),
                )
                .arg(
                    Arg::with_name("version")
                        .short("v")
                        .long("version")
                        .required(true)
                        .takes_value(true)
                        .help("firmware version"),
                )
                .arg(
                    Arg::with_name("file")
                        .short("f")
                        .long("file")
                        .required(true)
                        .takes_value(true)
                        .help("path to the firmware binary"),
                ),
        )
        .subcommand(
            App::new("delete")
                .about("removes a firmware and its binary")
                .arg(
                    Arg::with_name("id")
                        .long("id")
                        .required(true)
                        .takes_value(true)
                        .help("firmware id"),
                ),
        )
        .subcommand(
            App::new("flash")
                .about("uploads a firmware to devices")
                .arg(
                    Arg::with_name("firmware")
                        .short("f")
                        .long("firmware")
                        .required(true)
                        .takes_value(true)
                        .help("firmware id"),
                )
                .arg(
                    Arg::with_name("device")
                        .short("d")
                        .long("device")
                        .required(true)
                        .takes_value(true)
                        .multiple(true)
                        .number_of_values(1)
                        .help("device id or ip, may be repeated"),
                ),
        )
        .subcommand(App::new("uploads").about("lists uploads in progress"))
        .subcommand(
            App::new("abort")
                .about("aborts an upload")
                .arg(
                    Arg::with_name("task")
                        .short("t")
                        .long("task")
                        .required(true)
                        .takes_value(true)
                        .help("task id"),
                ),
        )
        .subcommand(App::new("watch").about("follows upload progress"))
        .get_matches();

    let base = Url::parse(command_matches.value_of("url").unwrap_or("http://127.0.0.1:8080"))?;
    let client = Client::new();

    match command_matches.subcommand() {
        ("firmwares", Some(_)) => list_firmwares(&client, &base).await,
        ("boards", Some(_)) => list_boards(&client, &base).await,
        ("publish", Some(matches)) => publish(&client, &base, matches).await,
        ("delete", Some(matches)) => delete(&client, &base, matches).await,
        ("flash", Some(matches)) => flash(&client, &base, matches).await,
        ("uploads", Some(_)) => list_uploads(&client, &base).await,
        ("abort", Some(matches)) => abort(&client, &base, matches).await,
        ("watch", Some(_)) => watch(&base).await,
        _ => Ok(()),
    }
}

/// Fails with the gateway's error message on a non-2xx answer.
async fn check(response: Response) -> ota_gateway::Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => Err(format!("{} ({}): {}", status, body.error, body.message).into()),
        Err(_) => Err(format!("gateway answered {}", status).into()),
    }
}

fn parse_id(matches: &ArgMatches<'_>, name: &str) -> ota_gateway::Result<Uuid> {
    let raw = matches.value_of(name).unwrap_or_default();
    Uuid::parse_str(raw).map_err(|err| format!("invalid {} id {:?}: {}", name, raw, err).into())
}

fn print_firmware(info: &FirmwareInfo) {
    println!(
        "{}  {:<10} {:<10} {:<12} {}  {}",
        info.id, info.board, info.firmware_type, info.version, info.file_checksum, info.file_name
    );
}

async fn list_firmwares(client: &Client, base: &Url) -> ota_gateway::Result<()> {
    let response = check(client.get(base.join("firmwares")?).send().await?).await?;
    for info in response.json::<Vec<FirmwareInfo>>().await? {
        print_firmware(&info);
    }
    Ok(())
}

async fn list_boards(client: &Client, base: &Url) -> ota_gateway::Result<()> {
    let response = check(client.get(base.join("boards")?).send().await?).await?;
    for board in response.json::<Vec<BoardInfo>>().await? {
        println!("{:<10} {}", board.board, board.invitation_port);
    }
    Ok(())
}

async fn publish(client: &Client, base: &Url, matches: &ArgMatches<'_>) -> ota_gateway::Result<()> {
    let path = matches.value_of("file").unwrap_or_default();
    let binary = fs::read(path).map_err(|err| format!("cannot read {}: {}", path, err))?;

    let mut url = base.join("firmwares")?;
    url.query_pairs_mut()
        .append_pair("board", matches.value_of("board").unwrap_or_default())
        .append_pair("type", matches.value_of("type").unwrap_or_default())
        .append_pair("version", matches.value_of("version").unwrap_or_default());
    let response = check(client.post(url).body(binary).send().await?).await?;
    print_firmware(&response.json::<FirmwareInfo>().await?);
    Ok(())
}

async fn delete(client: &Client, base: &Url, matches: &ArgMatches<'_>) -> ota_gateway::Result<()> {
    let id = parse_id(matches, "id")?;
    let response = check(
        client
            .delete(base.join(&format!("firmwares/{}", id))?)
            .send()
            .await?,
    )
    .await?;
    let info = response.json::<FirmwareInfo>().await?;
    println!("deleted {} ({} {} {})", info.id, info.board, info.firmware_type, info.version);
    Ok(())
}

async fn flash(client: &Client, base: &Url, matches: &ArgMatches<'_>) -> ota_gateway::Result<()> {
    let request = UploadRequest {
        firmware_id: parse_id(matches, "firmware")?,
        devices: matches
            .values_of("device")
            .map(|values| values.map(String::from).collect())
            .unwrap_or_default(),
    };
    let response = check(client.post(base.join("uploads")?).json(&request).send().await?).await?;
    let outcomes = response.json::<BTreeMap<String, UploadOutcome>>().await?;
    for (device, outcome) in outcomes {
        match (outcome.task_id, outcome.error) {
            (Some(task_id), _) => println!("{:<20} started {}", device, task_id),
            (None, Some(error)) => println!("{:<20} refused: {}", device, error),
            (None, None) => println!("{:<20} refused", device),
        }
    }
    Ok(())
}

async fn list_uploads(client: &Client, base: &Url) -> ota_gateway::Result<()> {
    let response = check(client.get(base.join("uploads")?).send().await?).await?;
    for upload in response.json::<Vec<RunningUpload>>().await? {
        println!(
            "{}  {}  {:<20} {:<10} {:<32} {:>3}%",
            upload.task_id,
            format_timestamp(upload.started_at),
            upload.device.id,
            upload.firmware.version,
            upload.state.to_string(),
            upload.progress
        );
    }
    Ok(())
}

async fn abort(client: &Client, base: &Url, matches: &ArgMatches<'_>) -> ota_gateway::Result<()> {
    let task_id = parse_id(matches, "task")?;
    check(
        client
            .delete(base.join(&format!("uploads/{}", task_id))?)
            .send()
            .await?,
    )
    .await?;
    println!("abort requested for {}", task_id);
    Ok(())
}

async fn watch(base: &Url) -> ota_gateway::Result<()> {
    let mut url = base.join("uploads/events")?;
    let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
    url.set_scheme(scheme)
        .map_err(|_| format!("cannot derive a websocket url from {}", base))?;

    let (ws_stream, _) = connect_async(url).await?;
    let (_, mut read_stream) = ws_stream.split();
    while let Some(message) = read_stream.next().await {
        match message? {
            Message::Text(text) => {
                let event: ProgressEvent = serde_json::from_str(&text)?;
                let progress = event
                    .progress
                    .map(|p| format!("{:>3}%", p))
                    .unwrap_or_default();
                println!(
                    "{}  {}  {:<32} {}",
                    format_timestamp(create_timestamp()),
                    event.task_id,
                    event.status.to_string(),
                    progress
                );
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}
