//! Scripted websocket client for poking at a running ingest: joins under a
//! name, wanders around the room and says hello, printing whatever the
//! server sends back.

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use shared::packets::{ChatPacket, JoinPacket, MovePacket};
use shared::Packet;
use std::time::Duration;
use tokio::time::{interval, sleep};
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Ingest websocket url
    #[clap(short, long, default_value = "ws://127.0.0.1:8080")]
    url: String,
    /// Display name to join with
    #[clap(short, long, default_value = "TestBot")]
    name: String,
    /// Number of random moves before leaving
    #[clap(short, long, default_value = "10")]
    moves: u32,
}

fn frame(packet: &Packet) -> Result<Message, Box<dyn std::error::Error>> {
    Ok(Message::text(String::from_utf8(packet.encode()?)?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("Connecting to {}", args.url);
    let (ws, _) = connect_async(args.url.as_str()).await?;
    let (mut sink, mut source) = ws.split();

    let printer = tokio::spawn(async move {
        while let Some(Ok(message)) = source.next().await {
            if let Message::Text(text) = message {
                match Packet::decode(text.as_str().as_bytes()) {
                    Ok(packet) => println!("<- {}: {}", packet.kind(), text.as_str()),
                    Err(_) => println!("<- (unrecognized) {}", text.as_str()),
                }
            }
        }
        println!("Server closed the connection");
    });

    let join = Packet::Join(JoinPacket {
        name: args.name.clone(),
        ..JoinPacket::default()
    });
    sink.send(frame(&join)?).await?;
    sleep(Duration::from_millis(200)).await;

    sink.send(frame(&Packet::Chat(ChatPacket {
        message: format!("Hello from {}", args.name),
        ..ChatPacket::default()
    }))?)
    .await?;

    let mut ticker = interval(Duration::from_millis(500));
    for _ in 0..args.moves {
        ticker.tick().await;
        let (x, y) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0.05..0.95), rng.gen_range(0.05..0.95))
        };
        println!("-> move to ({:.2}, {:.2})", x, y);
        sink.send(frame(&Packet::Move(MovePacket {
            x,
            y,
            ..MovePacket::default()
        }))?)
        .await?;
    }

    sink.close().await?;
    printer.await?;
    Ok(())
}
