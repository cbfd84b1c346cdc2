use std::{io::BufRead, thread, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc,
    time::{MissedTickBehavior, interval},
};
use tracing::{info, warn};

use crate::{cli::ClientArgs, handler::MAX_CHUNK_SIZE, protocol::send_greeting};

/// Largest relayed chunk the server will send, with room to spare.
const RECEIVE_BUFFER_SIZE: usize = 2 * MAX_CHUNK_SIZE;

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;
    write_stdout(&format!("*** connected to {}:{}", args.host, args.port)).await?;

    match args.interval_ms {
        Some(interval_ms) => {
            run_auto_loop(&mut reader, &mut writer, Duration::from_millis(interval_ms)).await?
        }
        None => {
            let mut lines = spawn_stdin_reader()?;
            run_client_loop(&mut reader, &mut writer, &mut lines).await?
        }
    }
    shutdown_connection(&mut writer).await;

    Ok(())
}

async fn establish_connection(args: &ClientArgs) -> Result<(OwnedReadHalf, OwnedWriteHalf)> {
    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;

    send_greeting(&mut stream)
        .await
        .context("handshake with relay failed")?;
    info!("connected to {}:{}", args.host, args.port);

    Ok(stream.into_split())
}

/// Reads stdin on its own thread. A read blocked on `tokio::io::stdin`
/// cannot be cancelled and would keep the runtime from shutting down after
/// the relay hangs up.
fn spawn_stdin_reader() -> Result<mpsc::Receiver<io::Result<String>>> {
    let (tx, rx) = mpsc::channel(16);
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to spawn stdin reader")?;
    Ok(rx)
}

async fn run_client_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    lines: &mut mpsc::Receiver<io::Result<String>>,
) -> Result<()> {
    let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
    loop {
        select! {
            server_chunk = reader.read(&mut buf) => {
                if !handle_server_chunk(server_chunk, &buf).await? {
                    break;
                }
            }
            line = lines.recv() => {
                if !handle_stdin_input(line, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

/// Sends `mensaje <n>` on a fixed cadence, printing whatever arrives.
async fn run_auto_loop(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    period: Duration,
) -> Result<()> {
    let mut buf = [0u8; RECEIVE_BUFFER_SIZE];
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut counter: u64 = 0;

    loop {
        select! {
            server_chunk = reader.read(&mut buf) => {
                if !handle_server_chunk(server_chunk, &buf).await? {
                    break;
                }
            }
            _ = ticker.tick() => {
                let message = auto_message(counter);
                if let Err(error) = writer.write_all(message.as_bytes()).await {
                    warn!(?error, "failed to send message, stopping");
                    break;
                }
                counter += 1;
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

fn auto_message(counter: u64) -> String {
    format!("mensaje {counter}")
}

/// Chunks are printed one per line; the relay itself sends no terminator.
async fn handle_server_chunk(read: io::Result<usize>, buf: &[u8]) -> Result<bool> {
    match read? {
        0 => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        n => {
            write_stdout(&String::from_utf8_lossy(&buf[..n])).await?;
            Ok(true)
        }
    }
}

async fn handle_stdin_input(
    line: Option<io::Result<String>>,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };

    let mut line = line?;
    if line.trim_end().is_empty() {
        return Ok(true);
    }

    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shutdown client writer cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
