use std::fmt::Write as _;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use emojigrid_client::catalog::Catalog;
use emojigrid_client::client::{
    DisplayCell, GridClient, GridEvent, GridHandle, Viewport, WriteDecision,
};
use emojigrid_client::config::Config;
use emojigrid_client::telemetry;
use emojigrid_client::transport::websocket::WebSocketConnector;
use emojigrid_client::{CatalogId, GridDims};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use crate::cli::{Cli, Command, PlaceArgs, SearchArgs, WatchArgs};

const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.apply(Config::from_env().context("invalid EMOJIGRID_* environment")?);
    match &cli.command {
        Command::Search(args) => search(&config, args),
        Command::Watch(args) => watch(&config, args).await,
        Command::Place(args) => place(&config, args).await,
    }
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    Catalog::load(&config.catalog_path)
        .with_context(|| format!("loading catalog {}", config.catalog_path.display()))
}

fn search(config: &Config, args: &SearchArgs) -> Result<()> {
    let catalog = load_catalog(config)?;
    let mut shown = 0;
    for entry in catalog.search(&args.query).take(args.limit) {
        println!("{:>5}  {}  {}", entry.id, entry.glyph, entry.tags.join(", "));
        shown += 1;
    }
    if shown == 0 {
        println!("no emoji tagged {:?}", args.query);
    }
    Ok(())
}

fn connect(config: &Config) -> Result<GridClient> {
    let websocket = config.websocket();
    websocket
        .endpoint()
        .with_context(|| format!("endpoint {}", config.endpoint))?;
    info!(target: "emojigrid", endpoint = %config.endpoint, "starting client");
    Ok(GridClient::spawn(
        WebSocketConnector::new(websocket),
        GridDims::STANDARD,
        config.reconnect_policy(),
    ))
}

async fn await_snapshot(handle: &GridHandle) -> Result<()> {
    tokio::time::timeout(SNAPSHOT_TIMEOUT, handle.wait_for_snapshot())
        .await
        .map_err(|_| anyhow!("no snapshot from server after {SNAPSHOT_TIMEOUT:?}"))?
        .ok_or_else(|| anyhow!("client stopped before the first snapshot"))?;
    Ok(())
}

async fn watch(config: &Config, args: &WatchArgs) -> Result<()> {
    let catalog = match load_catalog(config) {
        Ok(catalog) => Some(catalog),
        Err(err) => {
            warn!(target: "emojigrid", error = %err, "showing raw ids");
            None
        }
    };
    let client = connect(config)?;
    let handle = client.handle();
    let visible = Viewport::at(args.row, args.col, args.rows, args.cols);
    let mut projector = handle.projector(visible, config.overscan);

    loop {
        let change = tokio::select! {
            change = projector.changed() => change,
            _ = tokio::signal::ctrl_c() => None,
        };
        if change.is_none() {
            break;
        }
        let frame = {
            let state = handle.replica().read();
            let cells = projector.project_visible(&state).map(|projected| projected.cell);
            render(cells, projector.visible().width(), catalog.as_ref())
        };
        println!("{frame}");
    }

    client.shutdown().await;
    let faults = telemetry::summary();
    if !faults.is_empty() {
        eprintln!("{faults}");
    }
    Ok(())
}

fn render(
    cells: impl Iterator<Item = DisplayCell>,
    width: usize,
    catalog: Option<&Catalog>,
) -> String {
    let mut out = String::new();
    for (index, cell) in cells.enumerate() {
        if index > 0 && width > 0 && index % width == 0 {
            out.push('\n');
        }
        match cell {
            DisplayCell::Empty => out.push('·'),
            DisplayCell::Placed(id) | DisplayCell::Pending(id) => {
                match catalog.and_then(|catalog| catalog.lookup(id)) {
                    Some(glyph) => out.push_str(glyph),
                    None => {
                        let _ = write!(out, "[{id}]");
                    }
                }
            }
        }
    }
    out
}

async fn place(config: &Config, args: &PlaceArgs) -> Result<()> {
    let catalog = load_catalog(config)?;
    let entry = catalog
        .resolve(&args.emoji)
        .ok_or_else(|| anyhow!("no emoji matches {:?}", args.emoji))?;
    let id: CatalogId = entry.id;

    let client = connect(config)?;
    let handle = client.handle();
    let result = claim(&handle, args, id, &entry.glyph).await;
    client.shutdown().await;
    result
}

async fn claim(handle: &GridHandle, args: &PlaceArgs, id: CatalogId, glyph: &str) -> Result<()> {
    let mut events = handle.subscribe();
    await_snapshot(handle).await?;

    match handle.request_write(args.row, args.col, id)? {
        WriteDecision::Accepted(_) => {}
        WriteDecision::Rejected(reason) => {
            bail!("cell ({}, {}) unavailable: {reason:?}", args.row, args.col)
        }
    }

    let verdict = tokio::time::timeout(Duration::from_secs(args.wait), async {
        loop {
            match events.recv().await {
                Ok(GridEvent::CellChanged {
                    row,
                    col,
                    cell: DisplayCell::Placed(stored),
                }) if (row, col) == (args.row, args.col) => {
                    return Some(stored);
                }
                Ok(GridEvent::SnapshotApplied { .. }) | Err(RecvError::Lagged(_)) => {
                    if let Ok(DisplayCell::Placed(stored)) = handle.cell(args.row, args.col) {
                        return Some(stored);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    })
    .await;

    match verdict {
        Ok(Some(stored)) if stored == id => {
            println!("placed {glyph} at ({}, {})", args.row, args.col);
            Ok(())
        }
        Ok(Some(stored)) => bail!(
            "lost the race for ({}, {}): cell now holds {stored}",
            args.row,
            args.col
        ),
        Ok(None) => bail!("client stopped before the server answered"),
        Err(_) => {
            println!(
                "still pending after {}s; the write will be retried on reconnect",
                args.wait
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn render_wraps_rows_and_marks_empty() {
        let smile = CatalogId::new(1).unwrap();
        let catalog = Catalog::from_json_str(r#"[{"id":"1","emoji":"😀","tags":["smile"]}]"#)
            .unwrap();
        let cells = vec![
            DisplayCell::Placed(smile),
            DisplayCell::Empty,
            DisplayCell::Pending(CatalogId::new(9).unwrap()),
            DisplayCell::Empty,
        ];
        assert_eq!(render(cells.into_iter(), 2, Some(&catalog)), "😀·\n[9]·");
    }
}
