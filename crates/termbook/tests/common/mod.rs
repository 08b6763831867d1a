//! Scripted in-process kernel for notebook-level tests.
//!
//! Every dispatched request is answered with events computed from the code,
//! delivered through the same event pump a real kernel would use.

use futures::future::BoxFuture;
use kernel_driver::{EventPayload, KernelEvent};
use termbook::KernelChannel;
use tokio::sync::mpsc;

pub struct FakeKernel {
    events: mpsc::Sender<KernelEvent>,
    respond: fn(&str) -> Vec<EventPayload>,
    counter: u32,
}

impl FakeKernel {
    pub fn new(events: mpsc::Sender<KernelEvent>, respond: fn(&str) -> Vec<EventPayload>) -> Self {
        FakeKernel {
            events,
            respond,
            counter: 0,
        }
    }
}

impl KernelChannel for FakeKernel {
    fn is_running(&self) -> bool {
        true
    }

    fn dispatch<'a>(
        &'a mut self,
        code: &'a str,
        register: Box<dyn FnOnce(String) + Send>,
    ) -> BoxFuture<'a, anyhow::Result<String>> {
        self.counter += 1;
        let token = format!("msg-{}", self.counter);
        register(token.clone());
        let payloads = (self.respond)(code);
        let events = self.events.clone();
        Box::pin(async move {
            let mut emitted = vec![EventPayload::Busy];
            emitted.extend(payloads);
            emitted.push(EventPayload::Idle);
            for payload in emitted {
                events
                    .send(KernelEvent {
                        token: Some(token.clone()),
                        payload,
                    })
                    .await
                    .ok();
            }
            Ok(token)
        })
    }

    fn shutdown<'a>(&'a mut self) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Evaluate `a+b+...` sums; anything else echoes the code back.
pub fn arithmetic(code: &str) -> Vec<EventPayload> {
    let sum = code
        .split('+')
        .map(|part| part.trim().parse::<i64>().ok())
        .try_fold(0i64, |acc, n| n.map(|n| acc + n));
    let text = match sum {
        Some(total) => total.to_string(),
        None => code.to_string(),
    };
    vec![EventPayload::ExecuteResult { text }]
}
