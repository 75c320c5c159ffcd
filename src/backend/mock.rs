use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::{ChannelFactory, CommandChannel, Quiescence};
use crate::error::{GafferError, Result};

/// Scripted in-memory channel for tests.
///
/// Maintains a fake "screen": every sent command is echoed onto it, and each
/// `await_quiescence` call appends the next scripted response. An empty
/// script queue produces a timeout, which is how tests exercise the
/// fail-closed paths.
#[derive(Default)]
pub struct MockChannel {
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    screen: String,
    responses: VecDeque<String>,
    sent: Vec<String>,
    alive: bool,
    pane: bool,
    started: u32,
}

impl MockChannel {
    pub fn new() -> Self {
        let channel = Self::default();
        {
            let mut state = channel.state.lock();
            state.alive = true;
            state.pane = true;
        }
        channel
    }

    /// Queue output that the next `await_quiescence` call will surface.
    pub fn push_response(&self, output: impl Into<String>) {
        self.state.lock().responses.push_back(output.into());
    }

    /// Everything that was sent to the channel, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn start_count(&self) -> u32 {
        self.state.lock().started
    }

    pub fn set_alive(&self, alive: bool) {
        self.state.lock().alive = alive;
    }

    pub fn set_pane(&self, pane: bool) {
        self.state.lock().pane = pane;
    }

    /// Suppress the command echo for subsequent sends, simulating a terminal
    /// that mangles long input lines.
    pub fn suppress_echo(&self) {
        self.state.lock().screen.push_str("\u{0}suppress-echo\u{0}");
    }
}

#[async_trait]
impl CommandChannel for MockChannel {
    async fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.alive = true;
        state.pane = true;
        state.started += 1;
        state.screen.clear();
        Ok(())
    }

    async fn send(&self, text: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.alive {
            return Err(GafferError::Backend("mock session is dead".to_string()));
        }
        state.sent.push(text.to_string());
        let suppress = state.screen.contains("\u{0}suppress-echo\u{0}");
        if suppress {
            // Screen still changes (cursor noise), but the command text is
            // not observable.
            state.screen.push_str("\n~\n");
        } else {
            state.screen.push_str("\n> ");
            state.screen.push_str(text);
            state.screen.push('\n');
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<String> {
        Ok(self.state.lock().screen.clone())
    }

    async fn is_alive(&self) -> bool {
        self.state.lock().alive
    }

    async fn pane_exists(&self) -> bool {
        let state = self.state.lock();
        state.alive && state.pane
    }

    async fn await_quiescence(
        &self,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Quiescence> {
        if cancel.is_cancelled() {
            return Ok(Quiescence::Cancelled);
        }
        let mut state = self.state.lock();
        match state.responses.pop_front() {
            Some(response) => {
                state.screen.push_str(&response);
                state.screen.push('\n');
                Ok(Quiescence::Settled {
                    output: state.screen.clone(),
                })
            }
            None => Ok(Quiescence::TimedOut {
                last_output: state.screen.clone(),
            }),
        }
    }

    async fn kill(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.alive = false;
        state.pane = false;
        Ok(())
    }
}

/// Hands the same shared mock channels out by slot, so tests can script and
/// inspect the channels a pool owns.
pub struct MockChannelFactory {
    channels: Vec<Arc<MockChannel>>,
}

impl MockChannelFactory {
    pub fn new(size: usize) -> Self {
        Self {
            channels: (0..size).map(|_| Arc::new(MockChannel::new())).collect(),
        }
    }

    pub fn channel(&self, slot: usize) -> Arc<MockChannel> {
        Arc::clone(&self.channels[slot])
    }
}

impl ChannelFactory for MockChannelFactory {
    fn create(&self, slot: usize) -> Arc<dyn CommandChannel> {
        self.channels[slot].clone()
    }
}
