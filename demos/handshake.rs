use btc_net::{
    Codec, FrameDecoder, Message, Network, PeerAddress, ServiceFlags, VersionPayload,
    PROTOCOL_VERSION,
};
use crossbeam_utils::sync::WaitGroup;
use std::io::{BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

/// This example connects to Bitcoin nodes and performs a handshake with each.
const BTC_SEED: &str = "seed.bitcoin.sipa.be";

/// How many seed addresses to try.
const MAX_PEERS: usize = 8;

const TIMEOUT: Duration = Duration::from_secs(3);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let network = Network::MainNet;
    tracing::info!("Getting seed from {}", BTC_SEED);

    // Get the addresses of the Bitcoin nodes.
    let addrs = (BTC_SEED, network.default_port())
        .to_socket_addrs()?
        .take(MAX_PEERS)
        .collect::<Vec<_>>();

    let wg = WaitGroup::new();

    // Spawn a thread for each address.
    for socket in addrs {
        let wg = wg.clone();

        thread::spawn(move || {
            match handshake(Codec::new(network), socket) {
                Ok(version) => {
                    tracing::info!("Handshake successful with {} ({})", socket, version.user_agent);
                }
                Err(err) => {
                    tracing::error!("Handshake failed with {}: {}", socket, err);
                }
            }

            drop(wg);
        });
    }

    // Wait for all the threads to finish.
    wg.wait();

    Ok(())
}

// Performs a handshake with the Bitcoin node and returns its version.
fn handshake(codec: Codec, socket: SocketAddr) -> anyhow::Result<VersionPayload> {
    tracing::info!("Connecting to {}", socket);

    let mut stream = TcpStream::connect_timeout(&socket, TIMEOUT)?;
    stream.set_read_timeout(Some(TIMEOUT))?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut decoder = FrameDecoder::new();
    let mut checksummed = false;

    // Build the version message, which is the first message sent to the node.
    let version = Message::Version(VersionPayload::build(
        PROTOCOL_VERSION,
        ServiceFlags::NODE_NETWORK,
        PeerAddress::from_socket_addr(stream.local_addr()?, ServiceFlags::NODE_NETWORK),
        PeerAddress::from_socket_addr(socket, ServiceFlags::NODE_NETWORK),
        rand::random(),
        "/btc-net:handshake/",
        0,
    ));
    stream.write_all(&codec.encode(&version, checksummed)?)?;

    let mut theirs = None;
    let mut acknowledged = false;
    while theirs.is_none() || !acknowledged {
        let message = receive(&codec, &mut decoder, &mut reader, checksummed)?;
        tracing::info!("Received {} from {}", message, socket);

        match message {
            Message::Version(payload) => theirs = Some(payload),
            // their verack switches both directions to checksummed frames
            Message::VerAck => {
                checksummed = true;
                acknowledged = true;
            }
            _ => {}
        }
    }

    // answer with our verack once we have both of theirs
    stream.write_all(&codec.encode(&Message::VerAck, checksummed)?)?;

    theirs.ok_or_else(|| anyhow::anyhow!("No version from {}", socket))
}

fn receive(
    codec: &Codec,
    decoder: &mut FrameDecoder,
    reader: &mut BufReader<TcpStream>,
    checksummed: bool,
) -> anyhow::Result<Message> {
    // one byte per call, so bytes after a frame stay in the reader
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            anyhow::bail!("Connection closed");
        }

        if let Some(frame) = decoder.decode(codec, &mut &byte[..], checksummed)? {
            return Ok(codec.decode(frame)?);
        }
    }
}
