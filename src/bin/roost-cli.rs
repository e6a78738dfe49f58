//! Roost CLI Client
//!
//! Interactive RESP client. Arguments are split on whitespace and sent as
//! an array of bulk strings; after SUBSCRIBE the client keeps printing
//! pushed messages until the connection closes or Ctrl+C.

use clap::Parser;
use futures::{SinkExt, StreamExt};
use roost::protocol::{RespCodec, RespValue};
use std::io::{self, Write};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

/// Roost CLI - Interactive Client
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 6379)]
    port: u16,

    /// Run one command and exit
    command: Vec<String>,
}

type Connection = Framed<TcpStream, RespCodec>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let addr = format!("{}:{}", args.host, args.port);

    let stream = TcpStream::connect(&addr).await?;
    let mut framed = Framed::new(stream, RespCodec::new());

    if !args.command.is_empty() {
        run_command(&mut framed, args.command).await?;
        return Ok(());
    }

    println!("Connected to Roost at {}. Type 'help' for available commands, 'quit' to exit.\n", addr);

    loop {
        print!("{}> ", addr);
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        if input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        if input.eq_ignore_ascii_case("help") {
            print_help();
            continue;
        }

        let parts = input.split_whitespace().map(str::to_string).collect();
        if !run_command(&mut framed, parts).await? {
            break;
        }
    }

    Ok(())
}

/// Send one command and print its replies. Returns false once the
/// session is over (connection closed or subscription ended).
async fn run_command(framed: &mut Connection, parts: Vec<String>) -> anyhow::Result<bool> {
    let name = parts[0].to_ascii_uppercase();
    let argc = parts.len() - 1;
    framed.send(RespValue::command(parts)).await?;

    if name == "SUBSCRIBE" {
        stream_messages(framed).await?;
        return Ok(false);
    }

    // (UN)SUBSCRIBE answers once per room
    let replies = if name == "UNSUBSCRIBE" { argc.max(1) } else { 1 };
    for _ in 0..replies {
        match framed.next().await {
            Some(Ok(reply)) => println!("{}", reply),
            Some(Err(e)) => {
                eprintln!("Error: {}", e);
                return Ok(false);
            }
            None => {
                eprintln!("Connection closed by server");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

async fn stream_messages(framed: &mut Connection) -> anyhow::Result<()> {
    println!("Reading messages... (press Ctrl+C to quit)");
    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(value)) => println!("{}", value),
                Some(Err(e)) => return Err(e.into()),
                None => {
                    eprintln!("Connection closed by server");
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn print_help() {
    println!(
        r#"
Available commands:

  GET <key>                 - Get value for key
  SET <key> <value>         - Set key-value pair
  COMMAND                   - Handshake check, replies OK
  SUBSCRIBE <room> [room..] - Join rooms and print published messages
  UNSUBSCRIBE [room..]      - Leave rooms (all when none given)
  PUBLISH <room> <message>  - Send a message to every subscriber of a room

  help                      - Show this help
  quit / exit               - Exit the CLI

Examples:
  SET mykey myvalue
  GET mykey
  PUBLISH news hello
"#
    );
}
