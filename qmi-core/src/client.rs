//! Per-client handles and the registry that routes indications to them
//! (spec.md 3.1, 4.4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::codec::{Message, MessageBuilder, CLIENT_BROADCAST};
use crate::error::CoreResult;
use crate::transaction::{AbortHooks, CancelToken, TransactionManager};

/// One allocated `(service, client_id)` pair (spec.md 3.1). Built by
/// [`Device::allocate_client`](crate::device::Device::allocate_client); send
/// requests through it and drain `next_indication` for anything the
/// service pushes unsolicited.
pub struct Client {
    service: u8,
    client_id: u8,
    manager: Arc<TransactionManager>,
    indications: mpsc::UnboundedReceiver<Message>,
}

impl Client {
    pub(crate) fn new(
        service: u8,
        client_id: u8,
        manager: Arc<TransactionManager>,
        indications: mpsc::UnboundedReceiver<Message>,
    ) -> Client {
        Client { service, client_id, manager, indications }
    }

    pub fn service(&self) -> u8 {
        self.service
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    /// Builds a request against `message_id` with `build`, sends it, and
    /// waits for its response (spec.md 4.3 steps 1-8). The placeholder
    /// transaction id `0` passed to [`MessageBuilder::new`] is overwritten
    /// by the transaction manager before the request goes out.
    pub async fn send(
        &self,
        message_id: u16,
        build: impl FnOnce(&mut MessageBuilder) -> CoreResult<()>,
        timeout: Duration,
    ) -> CoreResult<Message> {
        let mut builder = MessageBuilder::new(self.service, self.client_id, 0, message_id)?;
        build(&mut builder)?;
        let request = builder.finish();
        self.manager.send_request(request, timeout).await
    }

    /// `command_full(message_id, build, timeout, cancellable)`: a standard,
    /// non-abortable command with cancellation support (spec.md 4.4.5).
    pub async fn command_full(
        &self,
        message_id: u16,
        build: impl FnOnce(&mut MessageBuilder) -> CoreResult<()>,
        timeout: Duration,
        cancellable: Option<CancelToken>,
    ) -> CoreResult<Message> {
        let mut builder = MessageBuilder::new(self.service, self.client_id, 0, message_id)?;
        build(&mut builder)?;
        let request = builder.finish();
        self.manager.command_full(request, timeout, cancellable).await
    }

    /// `command_abortable(message_id, build, timeout, abort_hooks, cancellable)`:
    /// as `command_full`, with the abort protocol wired through
    /// caller-supplied `abort_hooks` (spec.md 4.3.5, 4.4.5).
    pub async fn command_abortable(
        &self,
        message_id: u16,
        build: impl FnOnce(&mut MessageBuilder) -> CoreResult<()>,
        timeout: Duration,
        abort_hooks: AbortHooks,
        cancellable: Option<CancelToken>,
    ) -> CoreResult<Message> {
        let mut builder = MessageBuilder::new(self.service, self.client_id, 0, message_id)?;
        build(&mut builder)?;
        let request = builder.finish();
        self.manager.command_abortable(request, timeout, Some(abort_hooks), cancellable).await
    }

    /// Waits for the next indication addressed to this client, or to the
    /// service's broadcast client id (spec.md 4.4.4).
    pub async fn next_indication(&mut self) -> Option<Message> {
        self.indications.recv().await
    }
}

/// Maps `(service, client_id)` to the channel a [`Client`] reads
/// indications from, and fans broadcast indications (client id
/// [`CLIENT_BROADCAST`]) out to every client currently registered for that
/// service (spec.md 4.4.4).
pub(crate) struct ClientRegistry {
    senders: StdMutex<HashMap<(u8, u8), mpsc::UnboundedSender<Message>>>,
}

impl ClientRegistry {
    pub(crate) fn new() -> ClientRegistry {
        ClientRegistry { senders: StdMutex::new(HashMap::new()) }
    }

    pub(crate) fn register(&self, service: u8, client_id: u8) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().insert((service, client_id), tx);
        rx
    }

    pub(crate) fn unregister(&self, service: u8, client_id: u8) {
        self.senders.lock().unwrap().remove(&(service, client_id));
    }

    pub(crate) fn dispatch(&self, message: Message) {
        let table = self.senders.lock().unwrap();
        if message.get_client_id() == CLIENT_BROADCAST {
            for ((service, _client_id), tx) in table.iter() {
                if *service == message.get_service() {
                    let _ = tx.send(message.clone());
                }
            }
        } else if let Some(tx) = table.get(&(message.get_service(), message.get_client_id())) {
            let _ = tx.send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Message;

    #[test]
    fn broadcast_fans_out_to_every_client_of_the_service() {
        let registry = ClientRegistry::new();
        let mut a = registry.register(0x02, 1);
        let mut b = registry.register(0x02, 2);
        let mut other_service = registry.register(0x03, 1);

        let indication = Message::new_from_data(0x02, CLIENT_BROADCAST, 0, 0x0010, &[]).unwrap();
        registry.dispatch(indication);

        assert!(a.try_recv().is_ok());
        assert!(b.try_recv().is_ok());
        assert!(other_service.try_recv().is_err());
    }

    #[test]
    fn unicast_goes_only_to_its_own_client() {
        let registry = ClientRegistry::new();
        let mut mine = registry.register(0x02, 1);
        let mut theirs = registry.register(0x02, 2);

        let indication = Message::new_from_data(0x02, 1, 0, 0x0010, &[]).unwrap();
        registry.dispatch(indication);

        assert!(mine.try_recv().is_ok());
        assert!(theirs.try_recv().is_err());
    }

    #[test]
    fn unregistered_client_is_silently_dropped() {
        let registry = ClientRegistry::new();
        registry.unregister(0x02, 9);
        let indication = Message::new_from_data(0x02, 9, 0, 0x0010, &[]).unwrap();
        registry.dispatch(indication); // must not panic
    }

    /// spec.md 8.2 scenario 5: (NAS, 4) and (DMS, 2) registered; a
    /// unicast to (NAS, 4) and a broadcast to (NAS, 0xFF) both reach only
    /// the NAS client, and a broadcast to an unregistered service (PDS)
    /// reaches neither.
    #[test]
    fn indication_routing_matches_service_and_client_id() {
        const NAS: u8 = 0x03;
        const DMS: u8 = 0x02;
        const PDS: u8 = 0x06;

        let registry = ClientRegistry::new();
        let mut nas = registry.register(NAS, 4);
        let mut dms = registry.register(DMS, 2);

        registry.dispatch(Message::new_from_data(NAS, 4, 0, 0x0010, &[]).unwrap());
        assert!(nas.try_recv().is_ok());
        assert!(dms.try_recv().is_err());

        registry.dispatch(Message::new_from_data(NAS, CLIENT_BROADCAST, 0, 0x0010, &[]).unwrap());
        assert!(nas.try_recv().is_ok());
        assert!(dms.try_recv().is_err());

        registry.dispatch(Message::new_from_data(PDS, CLIENT_BROADCAST, 0, 0x0010, &[]).unwrap());
        assert!(nas.try_recv().is_err());
        assert!(dms.try_recv().is_err());
    }
}
