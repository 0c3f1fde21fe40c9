/*!
Bob: connects to Alice, follows her key exchanges and chats.

Run `cargo run --example bob [port]` after `alice` is listening. Type a line to
send it encrypted. Commands:

- `/rotate` ask Alice for a new key
- `/eve on|off` toggle the simulated eavesdropper
- `/quit` disconnect
*/

use bb84_protocol::{NetworkConfig, Peer, PeerEvent, ProtocolConfig, Result, Role};
use std::{
    env,
    io::{self, BufRead},
    sync::mpsc,
    thread,
    time::Duration,
};

fn follow_exchange(peer: &mut Peer) {
    match peer.respond_to_exchange() {
        Ok(report) => println!(
            "Key {} received: {} bits, error rate {:.1}%",
            report.key_id,
            report.final_key.len(),
            report.error_rate * 100.0
        ),
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
    let mut bob = Peer::connect(Role::Responder, ProtocolConfig::new(), &network)?;
    println!("Connected to Alice at {}", network.address());

    let (line_tx, lines) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(|l| l.ok()) {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        if let Some(event) = bob.poll_event(Duration::from_millis(100)) {
            match event {
                PeerEvent::ExchangeRequested { exchange_id, photon_count } => {
                    println!("Alice started exchange {} with {} photons", exchange_id, photon_count);
                    follow_exchange(&mut bob);
                }
                PeerEvent::ChatReceived { sender, details } => println!("{}: {}", sender, details.plaintext),
                PeerEvent::KeyDesynchronized { .. } => {
                    println!("Keys out of step, asking for a new key");
                    bob.request_rotation()?;
                }
                PeerEvent::EveToggled { active } => {
                    println!("Alice turned the eavesdropper {}", if active { "on" } else { "off" })
                }
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
            "/rotate" => bob.request_rotation()?,
            "/eve on" => bob.set_eve(true)?,
            "/eve off" => bob.set_eve(false)?,
            text => match bob.send_chat(text) {
                Ok(sent) => println!("(sent {} bits with key {})", sent.details.bits_used, sent.details.key_id),
                Err(e) => println!("Send failed: {}", e),
            },
        }
    }

    bob.shutdown();
    Ok(())
}
