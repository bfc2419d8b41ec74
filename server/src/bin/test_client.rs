//! Terminal client for poking at a running server by hand.
//!
//! Every line typed on stdin is sent as one text message and every message
//! from the server is printed on its own line.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server URL to connect to
    #[arg(short = 's', long, default_value = "ws://127.0.0.1:443")]
    server: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let (ws, _) = connect_async(args.server.as_str()).await?;
    info!("Connected to {}", args.server);
    println!("Try `:host <name>` or `:join <lobby>`");

    let (mut sink, mut stream) = ws.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => sink.send(Message::Text(line.into())).await?,
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => println!("< {}", text.as_str()),
                    Some(Ok(Message::Close(_))) | None => {
                        println!("Server closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}
