use std::sync::Arc;
use std::thread;

use kcp::{BlockCrypt, Salsa20Crypt};

fn main() {
    let key = [0x17u8; 32];
    let crypt: Arc<dyn BlockCrypt> = Arc::new(Salsa20Crypt::new(&key).unwrap());

    let listener = kcp::listen_with_options("127.0.0.1:9090", Some(crypt), 10, 3).unwrap();
    println!(">>> Listening on {:?}", listener.local_addr().unwrap());

    loop {
        let sess = match listener.accept() {
            Ok(sess) => sess,
            Err(_) => break,
        };
        println!(">>> Session from {:?}", sess.remote_addr());

        thread::spawn(move || {
            sess.set_stream_mode(true);
            sess.set_nodelay(true, 10, 2, true);

            let mut buf = [0u8; 65536];
            loop {
                let n = match sess.read(&mut buf) {
                    Ok(n) => n,
                    Err(_) => break,
                };
                if sess.write(&buf[..n]).is_err() {
                    break;
                }
            }
        });
    }
}
