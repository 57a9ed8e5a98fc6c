//! Offer negotiation: one normalized update type for five wire events.
//!
//! The backend reports offer changes as `message_updated`, `new_offer`,
//! `offer_accepted`, `offer_rejected` and `offer_status_updated`. [`normalize`]
//! is the only place that knows about those names; everything downstream
//! works with [`OfferUpdate`] and merges it field-wise with [`merge_offer`].
//!
//! Updates can arrive before the message carrying the offer (an acceptance
//! pushed while history is still loading). Those are parked in
//! [`PendingOffers`] for a bounded window and replayed when the message shows
//! up.

use std::collections::VecDeque;

use tokio::time::Instant;

use haggle_proto::event::ServerEvent;
use haggle_proto::message::{Offer, OfferStatus, Transition, WireMessage};

use crate::config::OfferBufferConfig;

/// Which wire event an update came from. Logging only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferEventSource {
    /// `message_updated`
    MessageUpdated,
    /// `new_offer`
    NewOffer,
    /// `offer_accepted`
    Accepted,
    /// `offer_rejected`
    Rejected,
    /// `offer_status_updated`
    StatusUpdated,
    /// Offer embedded in a message from history or a push.
    Embedded,
}

/// A partial change to the offer for one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OfferUpdate {
    /// Order the offer negotiates.
    pub order_id: String,
    /// Confirmed id of the carrying message, when the event names it.
    pub message_id: Option<String>,
    /// New status, if the event carries one.
    pub status: Option<OfferStatus>,
    /// New price, if the event carries one.
    pub price: Option<f64>,
    /// New description, if the event carries one.
    pub description: Option<String>,
    /// Originating event.
    pub source: OfferEventSource,
}

impl OfferUpdate {
    /// Update carrying every field of an embedded offer.
    #[must_use]
    pub fn from_offer(offer: &Offer, message_id: Option<String>, source: OfferEventSource) -> Self {
        Self {
            order_id: offer.order_id.clone(),
            message_id,
            status: Some(offer.status),
            price: offer.price,
            description: offer.description.clone(),
            source,
        }
    }

    /// Fold a later update for the same order into this one.
    ///
    /// Status only moves forward; other fields take the later value when
    /// present. A later update whose status conflicts with a terminal one is
    /// dropped whole, as [`merge_offer`] would.
    pub fn absorb(&mut self, later: Self) {
        match (self.status, later.status) {
            (Some(current), Some(next)) => match current.transition(next) {
                Transition::Ignored => {
                    tracing::debug!(
                        order_id = %self.order_id,
                        current = %current,
                        attempted = %next,
                        source = ?later.source,
                        "conflicting parked offer update dropped"
                    );
                    return;
                }
                Transition::Applied => self.status = Some(next),
                Transition::Unchanged => {}
            },
            (None, next) => self.status = next,
            (Some(_), None) => {}
        }
        if later.price.is_some() {
            self.price = later.price;
        }
        if later.description.is_some() {
            self.description = later.description;
        }
        if later.message_id.is_some() {
            self.message_id = later.message_id;
        }
        self.source = later.source;
    }
}

fn from_message(message: &WireMessage, source: OfferEventSource) -> Option<OfferUpdate> {
    let offer = message.offer.as_ref()?;
    Some(OfferUpdate::from_offer(offer, message.id.clone(), source))
}

/// Translate any offer-related server event into an [`OfferUpdate`].
///
/// Returns `None` for events that do not concern offers, including
/// `message_updated` for a message without an offer.
#[must_use]
pub fn normalize(event: &ServerEvent) -> Option<OfferUpdate> {
    match event {
        ServerEvent::MessageUpdated { message } => {
            from_message(message, OfferEventSource::MessageUpdated)
        }
        ServerEvent::NewOffer { message } => from_message(message, OfferEventSource::NewOffer),
        ServerEvent::OfferAccepted {
            order_id,
            message_id,
        } => Some(OfferUpdate {
            order_id: order_id.clone(),
            message_id: message_id.clone(),
            status: Some(OfferStatus::Accepted),
            price: None,
            description: None,
            source: OfferEventSource::Accepted,
        }),
        ServerEvent::OfferRejected {
            order_id,
            message_id,
        } => Some(OfferUpdate {
            order_id: order_id.clone(),
            message_id: message_id.clone(),
            status: Some(OfferStatus::Rejected),
            price: None,
            description: None,
            source: OfferEventSource::Rejected,
        }),
        ServerEvent::OfferStatusUpdated {
            order_id,
            status,
            price,
            description,
        } => Some(OfferUpdate {
            order_id: order_id.clone(),
            message_id: None,
            status: Some(*status),
            price: *price,
            description: description.clone(),
            source: OfferEventSource::StatusUpdated,
        }),
        _ => None,
    }
}

/// Merge `update` into `local` field by field.
///
/// A conflicting status on a terminal offer is [`Transition::Ignored`] and
/// leaves every field untouched. Otherwise known fields absent from the
/// update are preserved. Returns [`Transition::Applied`] if anything changed.
pub fn merge_offer(local: &mut Offer, update: &OfferUpdate) -> Transition {
    let mut changed = false;
    if let Some(next) = update.status {
        match local.status.transition(next) {
            Transition::Ignored => {
                tracing::debug!(
                    order_id = %local.order_id,
                    current = %local.status,
                    attempted = %next,
                    source = ?update.source,
                    "stale offer status ignored"
                );
                return Transition::Ignored;
            }
            Transition::Applied => {
                local.status = next;
                changed = true;
            }
            Transition::Unchanged => {}
        }
    }
    if let Some(price) = update.price {
        if local.price != Some(price) {
            local.price = Some(price);
            changed = true;
        }
    }
    if let Some(description) = &update.description {
        if local.description.as_ref() != Some(description) {
            local.description = Some(description.clone());
            changed = true;
        }
    }
    if changed {
        Transition::Applied
    } else {
        Transition::Unchanged
    }
}

/// Merge an incoming embedded offer into a message's existing one.
pub fn merge_embedded(existing: &mut Option<Offer>, incoming: &Offer) -> Transition {
    match existing {
        Some(local) => merge_offer(
            local,
            &OfferUpdate::from_offer(incoming, None, OfferEventSource::Embedded),
        ),
        None => {
            *existing = Some(incoming.clone());
            Transition::Applied
        }
    }
}

struct Parked {
    update: OfferUpdate,
    received_at: Instant,
}

/// Bounded holding area for offer updates whose message is not loaded yet.
///
/// At most one entry per order id (later updates are folded in). Entries
/// older than the window are discarded; when full, the oldest is evicted.
pub struct PendingOffers {
    config: OfferBufferConfig,
    entries: VecDeque<Parked>,
}

impl PendingOffers {
    /// Creates an empty buffer.
    #[must_use]
    pub const fn new(config: OfferBufferConfig) -> Self {
        Self {
            config,
            entries: VecDeque::new(),
        }
    }

    /// Park `update` until its message arrives.
    pub fn hold(&mut self, update: OfferUpdate) {
        let now = Instant::now();
        self.purge_expired(now);

        if let Some(pos) = self
            .entries
            .iter()
            .position(|p| p.update.order_id == update.order_id)
        {
            if let Some(mut parked) = self.entries.remove(pos) {
                parked.update.absorb(update);
                parked.received_at = now;
                self.entries.push_back(parked);
            }
            return;
        }

        if self.config.capacity == 0 {
            tracing::warn!(order_id = %update.order_id, "offer buffer disabled, dropping update");
            return;
        }
        while self.entries.len() >= self.config.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::warn!(
                    order_id = %evicted.update.order_id,
                    "offer buffer full, evicting oldest update"
                );
            }
        }
        tracing::debug!(
            order_id = %update.order_id,
            "offer update parked until its message arrives"
        );
        self.entries.push_back(Parked {
            update,
            received_at: now,
        });
    }

    /// Remove and return the parked update for `order_id`, if still fresh.
    pub fn take(&mut self, order_id: &str) -> Option<OfferUpdate> {
        self.purge_expired(Instant::now());
        let pos = self
            .entries
            .iter()
            .position(|p| p.update.order_id == order_id)?;
        self.entries.remove(pos).map(|p| p.update)
    }

    /// Drop entries older than the window. Returns how many were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let window = self.config.window;
        self.entries.retain(|p| {
            let fresh = now.saturating_duration_since(p.received_at) <= window;
            if !fresh {
                tracing::debug!(order_id = %p.update.order_id, "parked offer update expired");
            }
            fresh
        });
        before - self.entries.len()
    }

    /// Number of parked updates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Order ids currently parked, oldest first.
    #[must_use]
    pub fn order_ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|p| p.update.order_id.clone())
            .collect()
    }
}
