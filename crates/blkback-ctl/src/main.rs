//! Administrative client for the blkback control socket.
//!
//! Sends a single fixed-shape command frame over the local control socket
//! and reports the daemon's verdict. Exit codes: 0 once a reply arrives,
//! 1 for usage or socket failures, 2 for an over-long argument.

mod payload;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use payload::{Payload, COMMAND_LEN, MESSAGE_LEN, REPLY_OK};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

const DEFAULT_SOCKET: &str = "/var/run/blkback/ctl.sock";

#[derive(Parser, Debug)]
#[command(name = "blkback-ctl", about = "Administrative client for the blkback daemon")]
struct Cli {
    /// Attach the named volume group
    #[arg(long, value_name = "NAME")]
    add: Option<String>,

    /// Detach the named volume group
    #[arg(long, value_name = "NAME", conflicts_with = "add")]
    del: Option<String>,

    /// Control socket path
    #[arg(long, value_name = "PATH", default_value = DEFAULT_SOCKET)]
    socket: PathBuf,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) if matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let command = match (&cli.add, &cli.del) {
        (Some(name), None) => format!("add {name}"),
        (None, Some(name)) => format!("del {name}"),
        _ => {
            eprintln!("one of --add or --del is required; see --help");
            return ExitCode::from(1);
        }
    };

    if command.len() >= COMMAND_LEN {
        eprintln!("input too long");
        return ExitCode::from(2);
    }

    match send(&cli.socket, &command) {
        Ok(reply) => {
            if reply == REPLY_OK {
                println!("message: ok");
            } else {
                println!("message: fail");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn send(socket: &Path, command: &str) -> Result<u32> {
    let mut stream = UnixStream::connect(socket)
        .with_context(|| format!("connecting to {}", socket.display()))?;

    stream
        .write_all(&Payload::cli(command).encode())
        .context("sending command")?;

    let mut frame = [0u8; MESSAGE_LEN];
    stream.read_exact(&mut frame).context("reading reply")?;
    Ok(Payload::decode(&frame).reply)
}
