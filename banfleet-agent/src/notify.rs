//! Systemd readiness notifications over `NOTIFY_SOCKET`.

#[cfg(target_os = "linux")]
mod imp {
    use tracing::debug;

    fn send(state: &str) {
        let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
            return;
        };
        let state = state.to_string();
        let result = (|| -> std::io::Result<()> {
            let socket = std::os::unix::net::UnixDatagram::unbound()?;
            socket.send_to(state.as_bytes(), &socket_path)?;
            Ok(())
        })();
        if let Err(err) = result {
            debug!(error = %err, "systemd notify failed");
        }
    }

    pub fn ready() {
        send("READY=1");
    }

    pub fn reloading() {
        send("RELOADING=1");
    }

    pub fn stopping() {
        send("STOPPING=1");
    }

    pub fn status(message: &str) {
        send(&format!("STATUS={message}"));
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    pub fn ready() {}
    pub fn reloading() {}
    pub fn stopping() {}
    pub fn status(_message: &str) {}
}

pub use imp::{ready, reloading, status, stopping};
