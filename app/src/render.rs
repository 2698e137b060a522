use parley_core::models::MessageRole;
use parley_core::{Completion, SessionUpdate};
use std::io::{self, Write};
use tokio::sync::mpsc::UnboundedReceiver;

/// Writes session updates to a terminal as they arrive.
pub struct TerminalRenderer<W: Write> {
    out: W,
    json: bool,
    mid_reply: bool,
}

impl TerminalRenderer<io::Stdout> {
    pub fn stdout(json: bool) -> Self {
        Self::new(io::stdout(), json)
    }
}

impl<W: Write> TerminalRenderer<W> {
    pub fn new(out: W, json: bool) -> Self {
        Self {
            out,
            json,
            mid_reply: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    pub fn render(&mut self, update: &SessionUpdate) -> io::Result<()> {
        if self.json {
            serde_json::to_writer(&mut self.out, update)?;
            self.out.write_all(b"\n")?;
            return self.out.flush();
        }

        match update {
            SessionUpdate::MessageAppended { message } if message.role == MessageRole::Assistant => {
                write!(self.out, "assistant> ")?;
                self.mid_reply = true;
            }
            SessionUpdate::AssistantDelta { delta, .. } => {
                write!(self.out, "{delta}")?;
            }
            SessionUpdate::GenerationFinished {
                completion,
                conversation_id,
            } => {
                self.end_reply()?;
                if *completion == Completion::Closed {
                    writeln!(self.out, "[reply ended before the service confirmed it]")?;
                }
                if let Some(id) = conversation_id {
                    writeln!(self.out, "[conversation {id}]")?;
                }
            }
            SessionUpdate::GenerationFailed { message } => {
                self.end_reply()?;
                writeln!(self.out, "[error] {message}")?;
            }
            SessionUpdate::SignedOut => {
                self.end_reply()?;
                writeln!(self.out, "[signed out]")?;
            }
            _ => {}
        }
        self.out.flush()
    }

    fn end_reply(&mut self) -> io::Result<()> {
        if self.mid_reply {
            writeln!(self.out)?;
            self.mid_reply = false;
        }
        Ok(())
    }
}

/// Render every update until all session handles are dropped.
pub async fn drive<W: Write>(
    mut renderer: TerminalRenderer<W>,
    mut updates: UnboundedReceiver<SessionUpdate>,
) -> io::Result<TerminalRenderer<W>> {
    while let Some(update) = updates.recv().await {
        renderer.render(&update)?;
    }
    Ok(renderer)
}
