//! Network control endpoint: OSC messages onto a window's control surface.
//!
//! One UDP endpoint per window, rebuilt against the new unit on every
//! migration. Incoming `/ctrl/<id>` float messages land on the same lock-free
//! endpoints the generated controls use, so remote control and the local
//! surface never race each other beyond last-writer-wins.

use crate::surface::ControlSurfaceSet;
use rosc::{OscPacket, OscType};
use segue_core::AtomicFloat;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const OSC_PREFIX: &str = "/ctrl/";

struct Binding {
    id: String,
    min: f32,
    max: f32,
    endpoint: Arc<AtomicFloat>,
}

/// A bound OSC endpoint serving one window's controls. Dropping it frees the
/// port and stops the listener thread.
pub struct OscControlEndpoint {
    port: u16,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl OscControlEndpoint {
    /// Bind the first free port in `[base, base + span)` and serve `surface`.
    ///
    /// Runs in the Binding step of the update protocol: failure to allocate
    /// any port is an interface-allocation failure and rolls the update back.
    pub fn bind_scan(
        base: u16,
        span: u16,
        surface: &ControlSurfaceSet,
    ) -> std::io::Result<Self> {
        let mut last_err = None;
        for port in base..base.saturating_add(span) {
            match UdpSocket::bind(("0.0.0.0", port)) {
                Ok(socket) => return Self::serve(socket, port, surface),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "no port in range")
        }))
    }

    fn serve(socket: UdpSocket, port: u16, surface: &ControlSurfaceSet) -> std::io::Result<Self> {
        socket.set_read_timeout(Some(Duration::from_millis(100)))?;

        let bindings: Vec<Binding> = surface
            .controls()
            .iter()
            .map(|control| Binding {
                id: control.spec().id.clone(),
                min: control.spec().min,
                max: control.spec().max,
                endpoint: control.endpoint(),
            })
            .collect();

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let thread = std::thread::Builder::new()
            .name(format!("segue-osc-{}", port))
            .spawn(move || listen(socket, bindings, stop_flag))?;

        tracing::debug!(port, "OSC control endpoint bound");
        Ok(Self {
            port,
            stop,
            thread: Some(thread),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for OscControlEndpoint {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn listen(socket: UdpSocket, bindings: Vec<Binding>, stop: Arc<AtomicBool>) {
    let mut buf = [0u8; rosc::decoder::MTU];
    while !stop.load(Ordering::Acquire) {
        let received = match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => len,
            // Timeouts keep the stop flag polled; anything else ends the
            // endpoint (the window will rebuild it on the next migration).
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(_) => break,
        };

        if let Ok((_, packet)) = rosc::decoder::decode_udp(&buf[..received]) {
            apply_packet(&packet, &bindings);
        }
    }
}

fn apply_packet(packet: &OscPacket, bindings: &[Binding]) {
    match packet {
        OscPacket::Message(message) => {
            let Some(id) = message.addr.strip_prefix(OSC_PREFIX) else {
                return;
            };
            let Some(binding) = bindings.iter().find(|binding| binding.id == id) else {
                return;
            };
            let value = match message.args.first() {
                Some(OscType::Float(value)) => *value,
                Some(OscType::Double(value)) => *value as f32,
                Some(OscType::Int(value)) => *value as f32,
                _ => return,
            };
            binding.endpoint.set(value.clamp(binding.min, binding.max));
        }
        OscPacket::Bundle(bundle) => {
            for inner in &bundle.content {
                apply_packet(inner, bindings);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segue_core::SineUnit;
    use std::time::Instant;

    fn send(port: u16, addr: &str, value: f32) {
        let packet = OscPacket::Message(rosc::OscMessage {
            addr: addr.to_string(),
            args: vec![OscType::Float(value)],
        });
        let bytes = rosc::encoder::encode(&packet).unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(&bytes, ("127.0.0.1", port)).unwrap();
    }

    fn wait_for(surface: &ControlSurfaceSet, id: &str, expected: f32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if surface.get(id) == Some(expected) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_osc_message_moves_control() {
        let unit = SineUnit::new(440.0, 48_000.0);
        let surface = ControlSurfaceSet::build(&unit).unwrap();
        let endpoint = OscControlEndpoint::bind_scan(39_500, 32, &surface).unwrap();

        send(endpoint.port(), "/ctrl/osc/freq", 660.0);
        assert!(wait_for(&surface, "osc/freq", 660.0));

        // Out-of-range values clamp to the control's range.
        send(endpoint.port(), "/ctrl/osc/level", 7.0);
        assert!(wait_for(&surface, "osc/level", 1.0));
    }

    #[test]
    fn test_unknown_address_ignored() {
        let unit = SineUnit::new(440.0, 48_000.0);
        let surface = ControlSurfaceSet::build(&unit).unwrap();
        let endpoint = OscControlEndpoint::bind_scan(39_550, 32, &surface).unwrap();

        send(endpoint.port(), "/ctrl/nope", 0.1);
        send(endpoint.port(), "/other/osc/freq", 0.1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(surface.get("osc/freq"), Some(440.0));
        drop(endpoint);
    }

    #[test]
    fn test_port_scan_skips_taken_port() {
        let unit = SineUnit::new(440.0, 48_000.0);
        let surface = ControlSurfaceSet::build(&unit).unwrap();
        let first = OscControlEndpoint::bind_scan(39_600, 8, &surface).unwrap();
        let second = OscControlEndpoint::bind_scan(39_600, 8, &surface).unwrap();
        assert_ne!(first.port(), second.port());
    }
}
