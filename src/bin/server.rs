use std::net::Shutdown;
use std::net::SocketAddrV4;
use std::str::FromStr;

use simptcp::Entity;

fn main() {
    env_logger::init();

    let entity = Entity::new(SocketAddrV4::from_str("127.0.0.1:5800").unwrap()).unwrap();

    let fd = entity.create().unwrap();
    entity.listen(fd, 4).unwrap();

    println!(">>> Waiting for incoming connections...");
    let (conn, peer) = entity.accept(fd).unwrap();
    println!(">>> Connection accepted from {}", peer);

    loop {
        let mut buf = [0u8; 1480];
        let n = entity.recv(conn, &mut buf).unwrap();

        if n == 0 {
            break;
        }

        entity.send(conn, &buf[..n]).unwrap();

        println!("\n>>> Read: {:?}\n", String::from_utf8_lossy(&buf[..n]));
    }

    entity.shutdown(conn, Shutdown::Both).unwrap();
    entity.close(conn).unwrap();
    entity.close(fd).unwrap();
}
