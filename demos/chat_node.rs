use bytes::{Buf, BytesMut};
use clap::Parser;
use clap_derive::Parser;
use courier::config::{TcpTransportConfig, UdpTransportConfig};
use courier::courier::Courier;
use courier::identity::{Identity, PeerId};
use courier::messaging::inbound::InboundMessageEvent;
use courier::messaging::message_type::{Message, MessageTypeId};
use courier::util::buf::{put_string, try_get_string};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::select;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    name: String,

    #[clap(long)]
    multicast_group: Option<String>,

    #[clap(long)]
    tcp_listen: Option<String>,

    #[clap(long)]
    tcp_connect: Vec<String>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Debug)]
struct ChatMessage {
    text: String,
}

impl Message for ChatMessage {
    const TYPE_ID: MessageTypeId = MessageTypeId::new(b"ChatText");

    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.text);
    }

    fn try_deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        Ok(ChatMessage { text: try_get_string(buf)? })
    }
}

/// Start several nodes on one machine or in one network. Lines typed on stdin are broadcast,
///  lines of the form `@<peer id> text` are sent reliably to that peer.
#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let mut udp_config = UdpTransportConfig::default();
    if let Some(group) = &args.multicast_group {
        udp_config.multicast_group = group.parse()?;
    }

    let mut builder = Courier::builder(Identity::create(args.name))
        .with_udp(udp_config);
    if let Some(addr) = &args.tcp_listen {
        let addr: SocketAddr = addr.parse()?;
        builder = builder.with_tcp(TcpTransportConfig::server(addr));
    }
    for addr in &args.tcp_connect {
        let addr: SocketAddr = addr.parse()?;
        builder = builder.with_tcp(TcpTransportConfig::client(addr));
    }
    let courier = builder.build().await?;
    info!("started as {}", courier.identity().id());

    courier.router().register_handler(|event: InboundMessageEvent<ChatMessage>| async move {
        let name = event.sender
            .and_then(|s| s.identity())
            .map(|i| i.vanity_name().to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("[{} {}] {}", name, event.sender_id, event.message.text);
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        let result = match line.strip_prefix('@').and_then(|l| l.split_once(' ')) {
            Some((peer, text)) => match peer.parse::<PeerId>() {
                Ok(peer) => courier.messenger().send_reliable(&ChatMessage { text: text.to_string() }, peer).await,
                Err(e) => Err(e),
            },
            None => courier.messenger().broadcast(&ChatMessage { text: line.clone() }).await,
        };
        if let Err(e) = result {
            warn!("sending failed: {}", e);
        }
    }

    courier.shutdown().await;
    Ok(())
}
