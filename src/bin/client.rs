use std::sync::Arc;

use kcp::{BlockCrypt, Salsa20Crypt};

fn main() {
    let key = [0x17u8; 32];
    let crypt: Arc<dyn BlockCrypt> = Arc::new(Salsa20Crypt::new(&key).unwrap());

    println!(">>> Trying to connect to server...");
    let sess = kcp::dial_with_options("127.0.0.1:9090", Some(crypt), 10, 3).unwrap();
    println!(">>> Connected, conv={}", sess.conv());

    sess.set_stream_mode(true);
    sess.set_nodelay(true, 10, 2, true);

    let mut buf = [0u8; 1500];
    for i in 0..10 {
        let msg = format!("hello{}", i);
        sess.write(msg.as_bytes()).unwrap();

        let n = sess.read(&mut buf).unwrap();
        println!(">>> Read: {:?}", String::from_utf8_lossy(&buf[..n]));
    }

    sess.close().unwrap();
}
