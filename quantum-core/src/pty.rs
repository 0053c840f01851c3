use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use uuid::Uuid;

use crate::shell;

/// Receives output and lifecycle notifications for PTY sessions.
pub trait PtyEventSender: Send + Sync + 'static {
    fn send(&self, id: &str, msg: PtyMessage);
}

/// Messages sent from a session's reader thread.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PtyMessage {
    Output { data: Vec<u8> },
    /// The process exited on its own (not via [`PtyManager::close_session`]).
    Exited,
}

/// A single PTY session.
pub struct PtySession {
    pub id: String,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn Child + Send + Sync>,
    pub master: Box<dyn MasterPty + Send>,
}

type SessionTable = Arc<Mutex<HashMap<String, PtySession>>>;

/// Manages all PTY sessions, keyed by the id derived from the spawned process.
pub struct PtyManager {
    sessions: SessionTable,
}

impl Default for PtyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl PtyManager {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn the user's shell in `cwd` and return the new session id.
    pub fn create_session(
        &self,
        sender: Arc<dyn PtyEventSender>,
        cwd: Option<&Path>,
        cols: u16,
        rows: u16,
    ) -> Result<String, String> {
        self.spawn(shell::build_shell_command(cwd), sender, cols, rows)
    }

    /// Spawn an arbitrary command in a new PTY.
    pub fn spawn(
        &self,
        cmd: CommandBuilder,
        sender: Arc<dyn PtyEventSender>,
        cols: u16,
        rows: u16,
    ) -> Result<String, String> {
        let pair = native_pty_system()
            .openpty(pty_size(cols, rows))
            .map_err(|e| format!("Failed to open PTY: {}", e))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| format!("Failed to spawn shell: {}", e))?;

        let id = child
            .process_id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| format!("Failed to get PTY writer: {}", e))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| format!("Failed to get PTY reader: {}", e))?;

        self.sessions
            .lock()
            .map_err(|e| format!("Lock poisoned: {}", e))?
            .insert(
                id.clone(),
                PtySession {
                    id: id.clone(),
                    writer,
                    child,
                    master: pair.master,
                },
            );

        let sessions = Arc::clone(&self.sessions);
        let session_id = id.clone();
        std::thread::spawn(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => sender.send(
                        &session_id,
                        PtyMessage::Output {
                            data: buf[..n].to_vec(),
                        },
                    ),
                    Err(e) => {
                        log::debug!("PTY reader for session {} stopped: {}", session_id, e);
                        break;
                    }
                }
            }

            // Still in the table means nobody closed it: the process ended by itself.
            let exited = sessions
                .lock()
                .ok()
                .and_then(|mut table| table.remove(&session_id));
            if let Some(mut session) = exited {
                let _ = session.child.wait();
                log::info!("Terminal session {} exited", session_id);
                sender.send(&session_id, PtyMessage::Exited);
            }
        });

        log::info!("Created terminal session {}", id);
        Ok(id)
    }

    /// Write data to a PTY session's stdin.
    pub fn write_to(&self, id: &str, data: &[u8]) -> Result<(), String> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|e| format!("Lock poisoned: {}", e))?;

        let session = sessions
            .get_mut(id)
            .ok_or_else(|| format!("Session not found: {}", id))?;

        session
            .writer
            .write_all(data)
            .map_err(|e| format!("Failed to write to PTY: {}", e))?;
        session
            .writer
            .flush()
            .map_err(|e| format!("Failed to flush PTY: {}", e))
    }

    pub fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), String> {
        let sessions = self
            .sessions
            .lock()
            .map_err(|e| format!("Lock poisoned: {}", e))?;

        sessions
            .get(id)
            .ok_or_else(|| format!("Session not found: {}", id))?
            .master
            .resize(pty_size(cols, rows))
            .map_err(|e| format!("Failed to resize PTY: {}", e))
    }

    /// Kill the session's process and drop it from the table.
    pub fn close_session(&self, id: &str) -> Result<(), String> {
        let removed = self
            .sessions
            .lock()
            .map_err(|e| format!("Lock poisoned: {}", e))?
            .remove(id);

        match removed {
            Some(mut session) => {
                let _ = session.child.kill();
                let _ = session.child.wait();
                log::info!("Closed terminal session {}", id);
                Ok(())
            }
            None => Err(format!("Session not found: {}", id)),
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .lock()
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for PtyManager {
    fn drop(&mut self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            for (_, mut session) in sessions.drain() {
                let _ = session.child.kill();
                let _ = session.child.wait();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct ChannelSender(Mutex<mpsc::Sender<(String, PtyMessage)>>);

    impl PtyEventSender for ChannelSender {
        fn send(&self, id: &str, msg: PtyMessage) {
            if let Ok(tx) = self.0.lock() {
                let _ = tx.send((id.to_string(), msg));
            }
        }
    }

    #[test]
    fn unknown_session_ids_are_errors() {
        let manager = PtyManager::new();
        assert_eq!(
            manager.write_to("404", b"ls\r").unwrap_err(),
            "Session not found: 404"
        );
        assert!(manager.resize("404", 80, 24).is_err());
        assert!(manager.close_session("404").is_err());
        assert!(manager.session_ids().is_empty());
    }

    #[test]
    fn pty_message_serialization() {
        let json = serde_json::to_value(PtyMessage::Exited).unwrap();
        assert_eq!(json, serde_json::json!({"type": "Exited"}));
    }

    #[cfg(unix)]
    #[test]
    fn short_lived_process_streams_output_then_exits() {
        let (tx, rx) = mpsc::channel();
        let sender = Arc::new(ChannelSender(Mutex::new(tx)));
        let manager = PtyManager::new();

        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", "printf quantum"]);
        let id = match manager.spawn(cmd, sender, 80, 24) {
            Ok(id) => id,
            // No pty device available in this environment.
            Err(_) => return,
        };
        assert!(id.parse::<u32>().is_ok());

        let mut output = Vec::new();
        loop {
            match rx.recv_timeout(Duration::from_secs(10)) {
                Ok((sid, PtyMessage::Output { data })) => {
                    assert_eq!(sid, id);
                    output.extend(data);
                }
                Ok((sid, PtyMessage::Exited)) => {
                    assert_eq!(sid, id);
                    break;
                }
                Err(_) => panic!("timed out waiting for the session to exit"),
            }
        }
        assert!(String::from_utf8_lossy(&output).contains("quantum"));
        assert!(manager.session_ids().is_empty());
    }
}
