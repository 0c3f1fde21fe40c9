/*!
Alice: listens for Bob, establishes a BB84 key and chats.

Run `cargo run --example alice [port]`, then start `bob` with the same port.
Type a line to send it encrypted. Commands:

- `/exchange` run a new key exchange
- `/eve on|off` toggle the simulated eavesdropper
- `/key` show the current key
- `/quit` disconnect
*/

use bb84_protocol::{
    NetworkConfig, Peer, PeerEvent, ProtocolConfig, Result, Role,
    core::crypto::cipher::{bits_to_string, text_to_bits},
};
use std::{
    env,
    io::{self, BufRead},
    net::TcpListener,
    sync::mpsc,
    thread,
    time::Duration,
};

fn report_exchange(peer: &mut Peer) {
    match peer.establish_key() {
        Ok(report) => {
            println!(
                "Key {} established: {} bits from {} photons ({:.0}% matched, error rate {:.1}%, {} attempt(s))",
                report.key_id,
                report.final_key.len(),
                report.photon_count,
                report.match_rate * 100.0,
                report.error_rate * 100.0,
                report.attempts
            );
            if report.eve_detected {
                println!("An eavesdropper was detected and the tainted key discarded");
            }
        }
        Err(e) => println!("Key exchange failed: {}", e),
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let port = env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(5000);
    let network = NetworkConfig::new("127.0.0.1", port);
    let listener = TcpListener::bind(network.address())?;
    println!("Alice listening on {}", network.address());

    let mut alice = Peer::accept(Role::Initiator, ProtocolConfig::new(), &listener, &network)?;
    println!("Bob connected");
    report_exchange(&mut alice);

    let (line_tx, lines) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(|l| l.ok()) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        if let Some(event) = alice.poll_event(Duration::from_millis(100)) {
            match event {
                PeerEvent::ChatReceived { sender, details } => {
                    println!("{}: {}  [{} bits @ {}]", sender, details.plaintext, details.bits_used, details.key_offset)
                }
                PeerEvent::RotationRequested => {
                    println!("Bob requested a new key");
                    report_exchange(&mut alice);
                }
                PeerEvent::EveToggled { active } => println!("Bob turned the eavesdropper {}", if active { "on" } else { "off" }),
                PeerEvent::Disconnected | PeerEvent::TransportLost { .. } => {
                    println!("Connection closed: {:?}", event);
                    break;
                }
                other => println!("{:?}", other),
            }
        }

        let Ok(line) = lines.try_recv() else { continue };
        match line.trim() {
            "" => {}
            "/quit" => break,
            "/exchange" => report_exchange(&mut alice),
            "/eve on" => alice.set_eve(true)?,
            "/eve off" => alice.set_eve(false)?,
            "/key" => match alice.key_info() {
                Some(info) => println!(
                    "Key {}: {}/{} bits used, error rate {:.1}%",
                    info.id,
                    info.bits_used,
                    info.length,
                    info.error_rate * 100.0
                ),
                None => println!("No active key"),
            },
            text => match alice.send_chat(text) {
                Ok(sent) => {
                    println!("(sent {} bits: {})", sent.details.bits_used, sent.details.ciphertext_hex);
                    if let Some(report) = &sent.rotation {
                        println!("(rotated to key {} first)", report.key_id);
                    }
                    if sent.rotation_advised {
                        println!("(key usage high, consider /exchange)");
                    }
                    log::debug!("Plaintext bits: {}", bits_to_string(&text_to_bits(text)));
                }
                Err(e) => println!("Send failed: {}", e),
            },
        }
    }

    alice.shutdown();
    Ok(())
}
