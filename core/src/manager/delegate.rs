//! The delegate task: model handlers and application events run here, off
//! the processing task.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Command, MeshEvent};
use crate::layers::access::Route;
use crate::layers::upper::{AccessKey, ReceivedAccess};
use crate::message::{Handled, MessageContext, ModelRegistry};

pub(crate) enum DelegateJob {
    Event(MeshEvent),
    Dispatch {
        message: ReceivedAccess,
        routes: Vec<Route>,
    },
}

pub(crate) fn spawn(
    registry: Arc<Mutex<ModelRegistry>>,
    commands: mpsc::WeakSender<Command>,
    events: mpsc::UnboundedSender<MeshEvent>,
) -> mpsc::UnboundedSender<DelegateJob> {
    let (jobs, mut job_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            match job {
                DelegateJob::Event(event) => {
                    let _ = events.send(event);
                }
                DelegateJob::Dispatch { message, routes } => {
                    let handled = dispatch(&registry, &commands, &message, &routes).await;
                    let _ = events.send(MeshEvent::MessageReceived { message, handled });
                }
            }
        }
        debug!("Delegate task finished");
    });
    jobs
}

/// Hands `message` to every routed model. Returns whether any model
/// supports its opcode.
async fn dispatch(
    registry: &Mutex<ModelRegistry>,
    commands: &mpsc::WeakSender<Command>,
    message: &ReceivedAccess,
    routes: &[Route],
) -> bool {
    let mut handled = false;
    let device_key = message.key == AccessKey::Device;
    for route in routes {
        let context = MessageContext {
            source: message.source,
            destination: message.destination,
            element: route.element,
            model: route.model,
            key: message.key,
            ttl: message.ttl,
        };
        let outcome = {
            let mut registry = registry.lock();
            match registry.get_mut(route.element, route.model) {
                Some(model) if model.uses_device_key() == device_key => {
                    model.handle_pdu(&message.pdu, &context)
                }
                _ => continue,
            }
        };
        match outcome {
            Handled::Unsupported => {}
            Handled::Rejected(e) => {
                handled = true;
                warn!(
                    model = %route.model,
                    opcode = message.pdu.opcode,
                    error = %e,
                    "Model rejected message; no response sent"
                );
            }
            Handled::Accepted(response) => {
                handled = true;
                let Some(response) = response else { continue };
                let Some(commands) = commands.upgrade() else {
                    return handled;
                };
                let _ = commands
                    .send(Command::Respond {
                        element: route.element,
                        model: route.model,
                        response,
                        request: message.clone(),
                    })
                    .await;
            }
        }
    }
    handled
}
