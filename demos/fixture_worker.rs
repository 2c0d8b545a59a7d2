//! A minimal stand-in for a worker program, used by the integration tests
//! under `tests/`. Speaks just enough of the netstring/CGI protocol to
//! drive the supervision engine end to end: it opens the handshake pipe,
//! binds its socket, and answers every exchange with a canned 200 response
//! unless its config file asks it to misbehave.
//!
//! Not part of the public crate API; built only as the `nack_worker` binary
//! so tests can put it on `PATH`.

use std::io;
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

struct Args {
    sock_path: PathBuf,
    pipe_path: PathBuf,
    config_path: PathBuf,
}

fn parse_args() -> Args {
    let mut sock_path = None;
    let mut pipe_path = None;
    let mut config_path = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--file" => sock_path = args.next().map(PathBuf::from),
            "--pipe" => pipe_path = args.next().map(PathBuf::from),
            "--debug" => {}
            other => config_path = Some(PathBuf::from(other)),
        }
    }

    Args {
        sock_path: sock_path.expect("--file <path> is required"),
        pipe_path: pipe_path.expect("--pipe <path> is required"),
        config_path: config_path.expect("a config path argument is required"),
    }
}

/// Frame contents for the fixture's canned response, keyed by the config
/// file's trimmed content so a single binary can drive every scenario.
enum Behavior {
    /// Answer every exchange with `200 "hello"`.
    Hello,
    /// Answer every exchange with `200` and the request body bytes sent
    /// straight back, so tests can confirm a body was actually streamed to
    /// the worker rather than dropped.
    Echo,
    /// Crash before opening the handshake pipe, after writing `message` to
    /// stderr, simulating a worker whose configuration fails to load.
    CrashOnLoad { message: String },
}

fn behavior_for(config: &str) -> Behavior {
    let trimmed = config.trim();
    if let Some(message) = trimmed.strip_prefix("crash:") {
        Behavior::CrashOnLoad {
            message: message.to_string(),
        }
    } else if trimmed == "echo" {
        Behavior::Echo
    } else {
        Behavior::Hello
    }
}

fn main() {
    let args = parse_args();
    let config = std::fs::read_to_string(&args.config_path).unwrap_or_default();
    let behavior = behavior_for(&config);

    if let Behavior::CrashOnLoad { message } = &behavior {
        eprintln!("{}", message);
        std::process::exit(1);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("building the fixture's runtime");
    rt.block_on(serve(args.sock_path, args.pipe_path, behavior));
}

async fn serve(sock_path: PathBuf, pipe_path: PathBuf, behavior: Behavior) {
    let listener = tokio::net::UnixListener::bind(&sock_path).expect("binding fixture socket");

    // Handshake: the supervisor already holds the pipe open for reading;
    // opening it for writing and dropping it again signals readiness.
    {
        let sender = std::fs::OpenOptions::new()
            .write(true)
            .open(&pipe_path)
            .expect("opening handshake pipe for writing");
        drop(sender);
    }

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("installing SIGTERM handler");
    let mut sigquit = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::quit())
        .expect("installing SIGQUIT handler");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                if let Ok((stream, _)) = accepted {
                    let _ = handle_connection(stream, &behavior).await;
                }
            }
            _ = sigterm.recv() => break,
            _ = sigquit.recv() => break,
        }
    }

    let _ = std::fs::remove_file(&sock_path);
    let _ = std::fs::remove_file(&pipe_path);
}

async fn handle_connection(mut stream: UnixStream, behavior: &Behavior) -> io::Result<()> {
    // The request environment frame; its contents don't affect the canned
    // response, so it's read and discarded.
    let _env = read_frame(&mut stream).await?;
    let mut body = Vec::new();
    loop {
        let chunk = read_frame(&mut stream).await?;
        if chunk.is_empty() {
            break;
        }
        body.extend_from_slice(&chunk);
    }

    write_frame(&mut stream, b"200").await?;
    write_frame(&mut stream, b"{}").await?;
    match behavior {
        Behavior::Echo => write_frame(&mut stream, &body).await?,
        _ => write_frame(&mut stream, b"hello").await?,
    }
    write_frame(&mut stream, b"").await?;
    Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut digits = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b':' {
            break;
        }
        digits.push(byte[0]);
    }
    let len: usize = std::str::from_utf8(&digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed netstring length"))?;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    stream.read_exact(&mut byte).await?; // trailing comma
    Ok(payload)
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> io::Result<()> {
    let header = format!("{}:", payload.len());
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(payload).await?;
    stream.write_all(b",").await?;
    Ok(())
}
