use std::net::Shutdown;
use std::net::SocketAddrV4;
use std::str::FromStr;

use simptcp::{Entity, BASE_PORT};

fn main() {
    env_logger::init();

    let entity = Entity::new(SocketAddrV4::from_str("127.0.0.1:5801").unwrap()).unwrap();
    let server = SocketAddrV4::from_str("127.0.0.1:5800").unwrap();

    let fd = entity.create().unwrap();
    entity.connect(fd, server, BASE_PORT).unwrap();
    println!(">>> Connected");

    for msg in ["hello", "from", "simptcp"] {
        entity.send(fd, msg.as_bytes()).unwrap();

        let mut buf = [0u8; 1480];
        let n = entity.recv(fd, &mut buf).unwrap();

        println!(">>> Echoed: {:?}", String::from_utf8_lossy(&buf[..n]));
    }

    entity.shutdown(fd, Shutdown::Write).unwrap();
    entity.close(fd).unwrap();
}
