use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "pulse-echo")]
#[command(about = "TCP/UDP echo server used as a local load-test target")]
struct Args {
    /// TCP listen address
    #[arg(long, default_value = "0.0.0.0:8078")]
    tcp: String,

    /// UDP listen address
    #[arg(long, default_value = "0.0.0.0:8078")]
    udp: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listener = TcpListener::bind(&args.tcp).await?;
    info!("TCP echo listening on {}", listener.local_addr()?);
    tokio::spawn(tcp_echo(listener));

    let socket = UdpSocket::bind(&args.udp).await?;
    info!("UDP echo listening on {}", socket.local_addr()?);
    tokio::spawn(udp_echo(socket));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

async fn tcp_echo(listener: TcpListener) {
    loop {
        let (mut sock, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };
        debug!("tcp connection from {peer}");
        tokio::spawn(async move {
            let mut buf = [0u8; 65536];
            loop {
                match sock.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("tcp connection from {peer} closed");
        });
    }
}

async fn udp_echo(socket: UdpSocket) {
    let mut buf = [0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                if let Err(e) = socket.send_to(&buf[..n], peer).await {
                    warn!("udp send to {peer} failed: {e}");
                }
            }
            Err(e) => warn!("udp recv failed: {e}"),
        }
    }
}
