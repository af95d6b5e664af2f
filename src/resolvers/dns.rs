use eyre::{Result, format_err};
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query},
    rr::{Name, RData, RecordType},
    serialize::binary::{BinDecodable, BinEncodable},
};
use std::net::IpAddr;
use tokio::{
    net::{self, UdpSocket},
    time::{Duration, timeout},
};

pub const DNS_PORT: u16 = 53;
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves `host` with the system resolver.
pub async fn lookup(host: &str) -> Result<Vec<IpAddr>> {
    let addrs = net::lookup_host((host, 0)).await?;
    Ok(addrs.map(|addr| addr.ip()).collect())
}

/// Asks `server` for the A records of `host`.
pub async fn query(server: &str, port: u16, host: &str) -> Result<Vec<IpAddr>> {
    let request = a_query(host)?;
    let id = request.id();

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.connect((server, port)).await?;
    socket.send(&request.to_bytes()?).await?;

    let mut buf = [0u8; 4096];
    let len = timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| format_err!("no answer from {server}:{port} for {host}"))??;

    let response = Message::from_bytes(&buf[..len])?;
    if response.id() != id {
        return Err(format_err!("unexpected answer from {server}:{port}"));
    }
    Ok(a_records(&response))
}

fn a_query(host: &str) -> Result<Message> {
    let mut name = Name::from_ascii(host)?;
    name.set_fqdn(true);

    let mut msg = Message::new();
    msg.set_id(fastrand::u16(..))
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::A));
    Ok(msg)
}

fn a_records(msg: &Message) -> Vec<IpAddr> {
    (msg.answers().iter())
        .filter_map(|record| match record.data() {
            Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
            _ => None,
        })
        .collect()
}
