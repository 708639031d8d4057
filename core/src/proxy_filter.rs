//! Client side of the GATT proxy filter.
//!
//! The proxy forwards to us only what its filter lets through, so the client
//! mirrors that filter locally. One configuration request is in flight at a
//! time; later ones wait in a FIFO buffer until the proxy's FilterStatus
//! acknowledges the current one.

use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::mesh::MeshNetwork;
use crate::pdu::{ProxyConfigurationMessage, ProxyFilterType};

/// Addresses per Add/Remove request.
pub const MAX_ADDRESSES_PER_REQUEST: usize = 5;

/// Filter installed when a proxy connects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProxyFilterSetup {
    /// Accept list with the local elements, their subscriptions and
    /// all-nodes.
    #[default]
    Automatic,
    AcceptList(Vec<Address>),
    RejectList(Vec<Address>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyFilterEvent {
    /// The locally tracked filter changed.
    Updated {
        filter_type: ProxyFilterType,
        addresses: Vec<Address>,
    },
    /// The proxy acknowledged a request.
    Acknowledged {
        filter_type: ProxyFilterType,
        list_size: u16,
    },
    /// The proxy's filter is full.
    LimitReached { max: u16 },
}

#[derive(Debug, Default)]
pub struct ProxyFilter {
    filter_type: ProxyFilterType,
    addresses: BTreeSet<Address>,
    in_flight: Option<ProxyConfigurationMessage>,
    buffer: VecDeque<ProxyConfigurationMessage>,
    resynchronized: bool,
}

/// Addresses an automatic accept list contains.
pub fn automatic_addresses(network: &MeshNetwork) -> Vec<Address> {
    let mut addresses = BTreeSet::new();
    if let Some(node) = network.local_node() {
        for (address, element) in node.elements_with_addresses() {
            addresses.insert(address);
            for model in &element.models {
                addresses.extend(model.subscribe.iter().map(|s| s.address));
            }
        }
    }
    addresses.insert(Address::ALL_NODES);
    addresses.into_iter().collect()
}

impl ProxyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_type(&self) -> ProxyFilterType {
        self.filter_type
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.addresses.iter().copied().collect()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Requests that have not been sent yet.
    pub fn queued(&self) -> usize {
        self.buffer.len()
    }

    /// Queues the initial filter for a freshly connected proxy.
    pub fn setup(&mut self, setup: &ProxyFilterSetup, network: &MeshNetwork) {
        let (filter_type, addresses) = match setup {
            ProxyFilterSetup::Automatic => (ProxyFilterType::AcceptList, automatic_addresses(network)),
            ProxyFilterSetup::AcceptList(list) => (ProxyFilterType::AcceptList, list.clone()),
            ProxyFilterSetup::RejectList(list) => (ProxyFilterType::RejectList, list.clone()),
        };
        debug!(%filter_type, count = addresses.len(), "Setting up proxy filter");
        self.set_type(filter_type);
        self.add(&addresses);
    }

    /// Queues a filter type change. The proxy clears its list when the type
    /// is set.
    pub fn set_type(&mut self, filter_type: ProxyFilterType) {
        self.buffer
            .push_back(ProxyConfigurationMessage::SetFilterType(filter_type));
    }

    /// Queues the addresses not already in the filter, in chunks.
    pub fn add(&mut self, addresses: &[Address]) {
        let new: Vec<Address> = addresses
            .iter()
            .copied()
            .filter(|a| !self.addresses.contains(a))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        for chunk in new.chunks(MAX_ADDRESSES_PER_REQUEST) {
            self.buffer
                .push_back(ProxyConfigurationMessage::AddAddresses(chunk.to_vec()));
        }
    }

    pub fn remove(&mut self, addresses: &[Address]) {
        let present: Vec<Address> = addresses
            .iter()
            .copied()
            .filter(|a| self.addresses.contains(a))
            .collect();
        for chunk in present.chunks(MAX_ADDRESSES_PER_REQUEST) {
            self.buffer
                .push_back(ProxyConfigurationMessage::RemoveAddresses(chunk.to_vec()));
        }
    }

    /// The next request to send, if none is in flight.
    pub fn next_request(&mut self) -> Option<ProxyConfigurationMessage> {
        if self.in_flight.is_some() {
            return None;
        }
        let request = self.buffer.pop_front()?;
        self.in_flight = Some(request.clone());
        Some(request)
    }

    /// Applies the proxy's FilterStatus to the request in flight and checks
    /// the result against what the proxy reports.
    pub fn on_status(&mut self, filter_type: ProxyFilterType, list_size: u16) -> Vec<ProxyFilterEvent> {
        let mut events = Vec::new();
        let size = usize::from(list_size);
        let mut limit_reached = false;
        match self.in_flight.take() {
            Some(ProxyConfigurationMessage::SetFilterType(t)) => {
                self.filter_type = t;
                self.addresses.clear();
            }
            Some(ProxyConfigurationMessage::AddAddresses(list)) => {
                let new: BTreeSet<Address> = list
                    .into_iter()
                    .filter(|a| !self.addresses.contains(a))
                    .collect();
                let room = size.saturating_sub(self.addresses.len());
                if filter_type == self.filter_type && room < new.len() {
                    // Addresses already accepted stay; the lowest new ones
                    // fill what is left.
                    self.addresses.extend(new.into_iter().take(room));
                    limit_reached = true;
                } else {
                    self.addresses.extend(new);
                }
            }
            Some(ProxyConfigurationMessage::RemoveAddresses(list)) => {
                for address in list {
                    self.addresses.remove(&address);
                }
            }
            Some(ProxyConfigurationMessage::FilterStatus { .. }) | None => {
                debug!("Unsolicited proxy filter status");
            }
        }

        if limit_reached {
            warn!(max = list_size, "Proxy filter limit reached");
            events.push(ProxyFilterEvent::LimitReached { max: list_size });
        } else if filter_type != self.filter_type || size != self.addresses.len() {
            if self.resynchronized {
                warn!(%filter_type, list_size, "Proxy filter still out of sync; accepting proxy state");
                self.filter_type = filter_type;
            } else {
                info!(%filter_type, list_size, "Proxy filter out of sync; resending");
                self.resynchronized = true;
                self.resynchronize();
            }
        } else if self.buffer.is_empty() {
            // Back in sync once every queued request is acknowledged.
            self.resynchronized = false;
        }

        events.push(ProxyFilterEvent::Updated {
            filter_type: self.filter_type,
            addresses: self.addresses(),
        });
        events.push(ProxyFilterEvent::Acknowledged {
            filter_type,
            list_size,
        });
        events
    }

    fn resynchronize(&mut self) {
        let addresses = self.addresses();
        self.buffer.clear();
        self.set_type(self.filter_type);
        for chunk in addresses.chunks(MAX_ADDRESSES_PER_REQUEST) {
            self.buffer
                .push_back(ProxyConfigurationMessage::AddAddresses(chunk.to_vec()));
        }
    }

    /// The bearer closed or a request could not be sent: the proxy's filter
    /// is gone, so is ours.
    pub fn reset(&mut self) -> ProxyFilterEvent {
        *self = Self::default();
        ProxyFilterEvent::Updated {
            filter_type: self.filter_type,
            addresses: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addresses(range: std::ops::Range<u16>) -> Vec<Address> {
        range.map(|a| Address(0xC000 + a)).collect()
    }

    #[test]
    fn test_requests_are_chunked_and_serialized() {
        let mut filter = ProxyFilter::new();
        filter.set_type(ProxyFilterType::AcceptList);
        filter.add(&addresses(0..7));

        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::SetFilterType(ProxyFilterType::AcceptList))
        );
        assert!(filter.is_busy());
        assert_eq!(filter.next_request(), None);

        filter.on_status(ProxyFilterType::AcceptList, 0);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(addresses(0..5)))
        );
        filter.on_status(ProxyFilterType::AcceptList, 5);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(addresses(5..7)))
        );
        let events = filter.on_status(ProxyFilterType::AcceptList, 7);
        assert!(events.contains(&ProxyFilterEvent::Acknowledged {
            filter_type: ProxyFilterType::AcceptList,
            list_size: 7
        }));
        assert_eq!(filter.addresses(), addresses(0..7));
        assert_eq!(filter.next_request(), None);
    }

    #[test]
    fn test_known_addresses_are_not_resent() {
        let mut filter = ProxyFilter::new();
        filter.add(&addresses(0..2));
        filter.next_request();
        filter.on_status(ProxyFilterType::AcceptList, 2);
        filter.add(&addresses(0..3));
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(addresses(2..3)))
        );
        // Removing an unknown address sends nothing.
        filter.on_status(ProxyFilterType::AcceptList, 3);
        filter.remove(&[Address(0x0042)]);
        assert_eq!(filter.next_request(), None);
    }

    #[test]
    fn test_overflow_keeps_lowest_addresses() {
        let mut filter = ProxyFilter::new();
        let mut requested = addresses(0..10);
        requested.reverse();
        filter.add(&requested);

        filter.next_request();
        filter.on_status(ProxyFilterType::AcceptList, 5);
        filter.next_request();
        let events = filter.on_status(ProxyFilterType::AcceptList, 6);

        assert!(events.contains(&ProxyFilterEvent::LimitReached { max: 6 }));
        assert_eq!(filter.addresses(), addresses(0..6));
    }

    #[test]
    fn test_mismatch_resynchronizes_once() {
        let mut filter = ProxyFilter::new();
        filter.add(&addresses(0..2));
        filter.next_request();
        filter.on_status(ProxyFilterType::RejectList, 2);

        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::SetFilterType(ProxyFilterType::AcceptList))
        );
        filter.on_status(ProxyFilterType::AcceptList, 0);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(addresses(0..2)))
        );
        // A second disagreement is accepted as is.
        filter.on_status(ProxyFilterType::RejectList, 2);
        assert_eq!(filter.filter_type(), ProxyFilterType::RejectList);
        assert_eq!(filter.next_request(), None);
    }

    #[test]
    fn test_overflow_keeps_addresses_already_accepted() {
        let mut filter = ProxyFilter::new();
        filter.add(&[Address(0xC005)]);
        filter.next_request();
        filter.on_status(ProxyFilterType::AcceptList, 1);

        filter.add(&[Address(0xC000), Address(0xC001)]);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(vec![Address(0xC000), Address(0xC001)]))
        );
        let events = filter.on_status(ProxyFilterType::AcceptList, 2);

        assert!(events.contains(&ProxyFilterEvent::LimitReached { max: 2 }));
        assert_eq!(filter.addresses(), vec![Address(0xC000), Address(0xC005)]);
        assert_eq!(filter.next_request(), None);
    }

    #[test]
    fn test_resynchronizes_again_after_recovering() {
        let mut filter = ProxyFilter::new();
        filter.add(&addresses(0..2));
        filter.next_request();
        filter.on_status(ProxyFilterType::RejectList, 2);

        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::SetFilterType(ProxyFilterType::AcceptList))
        );
        filter.on_status(ProxyFilterType::AcceptList, 0);
        filter.next_request();
        filter.on_status(ProxyFilterType::AcceptList, 2);
        assert_eq!(filter.addresses(), addresses(0..2));
        assert_eq!(filter.next_request(), None);

        // In sync again, so a later disagreement is resent rather than accepted.
        filter.on_status(ProxyFilterType::AcceptList, 7);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::SetFilterType(ProxyFilterType::AcceptList))
        );
        filter.on_status(ProxyFilterType::AcceptList, 0);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(addresses(0..2)))
        );
    }

    #[test]
    fn test_reset_returns_to_empty_accept_list() {
        let mut filter = ProxyFilter::new();
        filter.set_type(ProxyFilterType::RejectList);
        filter.next_request();
        filter.on_status(ProxyFilterType::RejectList, 0);
        filter.add(&addresses(0..3));
        filter.next_request();

        let event = filter.reset();
        assert_eq!(
            event,
            ProxyFilterEvent::Updated {
                filter_type: ProxyFilterType::AcceptList,
                addresses: vec![]
            }
        );
        assert!(!filter.is_busy());
        assert_eq!(filter.queued(), 0);
    }

    #[test]
    fn test_automatic_setup() {
        use crate::mesh::{Element, Model, ModelId, Node};
        use crate::address::MeshAddress;

        let mut network = MeshNetwork::new("filter");
        let mut model = Model::new(ModelId::GENERIC_ON_OFF_SERVER);
        model.subscribe.push(MeshAddress::new(Address(0xC005)));
        network.local_node = Some(Node::new(
            "local",
            Address(0x0010),
            vec![Element::new(vec![model]), Element::default()],
        ));

        let mut filter = ProxyFilter::new();
        filter.setup(&ProxyFilterSetup::Automatic, &network);
        filter.next_request();
        filter.on_status(ProxyFilterType::AcceptList, 0);
        assert_eq!(
            filter.next_request(),
            Some(ProxyConfigurationMessage::AddAddresses(vec![
                Address(0x0010),
                Address(0x0011),
                Address(0xC005),
                Address::ALL_NODES
            ]))
        );
    }
}
