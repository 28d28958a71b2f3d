//! Kernel link-event stream via a netlink route socket.
//!
//! Joins the RTMGRP_LINK multicast group to receive instantaneous
//! RTM_NEWLINK / RTM_DELLINK notifications and normalizes them into
//! added / up / down / removed transitions. Only actual operstate
//! transitions produce events; no event is ever fabricated.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use futures::stream::StreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::{LinkAttribute, LinkMessage, State};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{AsyncSocket, SocketAddr};
use tokio::sync::{mpsc, watch};

use crate::filter::InterfaceFilter;

/// Kind of link transition observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    /// Interface seen for the first time.
    Added,
    /// Operstate transitioned to up.
    Up,
    /// Operstate transitioned away from up.
    Down,
    /// Interface disappeared (RTM_DELLINK).
    Removed,
}

/// One link state transition.
#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub interface: String,
    pub ifindex: u32,
    pub kind: LinkEventKind,
    pub operstate: String,
    pub flags: u32,
    pub timestamp: DateTime<Utc>,
}

/// Normalize a kernel operstate to its string form.
fn operstate_str(state: &State) -> &'static str {
    match state {
        State::Unknown => "unknown",
        State::NotPresent => "notpresent",
        State::Down => "down",
        State::LowerLayerDown => "lowerlayerdown",
        State::Testing => "testing",
        State::Dormant => "dormant",
        State::Up => "up",
        _ => "unknown",
    }
}

/// Pull interface name and operstate out of a link message.
fn link_attrs(msg: &LinkMessage) -> (Option<String>, &'static str) {
    let mut name = None;
    let mut operstate = "unknown";
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::OperState(s) => operstate = operstate_str(s),
            _ => {}
        }
    }
    (name, operstate)
}

/// Watches kernel link notifications and emits [`LinkEvent`]s.
pub struct LinkWatcher {
    filter: InterfaceFilter,
    tx: mpsc::Sender<LinkEvent>,
    shutdown: watch::Receiver<bool>,
    previous_states: HashMap<String, String>,
}

impl LinkWatcher {
    pub fn new(
        filter: InterfaceFilter,
        tx: mpsc::Sender<LinkEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            filter,
            tx,
            shutdown,
            previous_states: HashMap::new(),
        }
    }

    /// Connect to the kernel and run until shutdown.
    ///
    /// Seeds the last-seen map from a full link dump first so that the
    /// initial burst of notifications does not report every existing
    /// interface as a transition.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (mut conn, handle, mut messages) = rtnetlink::new_connection()?;
        let group_addr = SocketAddr::new(0, rtnetlink::constants::RTMGRP_LINK);
        conn.socket_mut().socket_mut().bind(&group_addr)?;
        tokio::spawn(conn);

        self.previous_states = snapshot(&handle, &self.filter).await;
        tracing::info!(
            interfaces = self.previous_states.len(),
            "link watcher started"
        );

        loop {
            tokio::select! {
                msg = messages.next() => {
                    match msg {
                        Some((msg, _addr)) => self.handle_message(msg).await,
                        None => {
                            tracing::warn!("netlink stream closed");
                            return Ok(());
                        }
                    }
                }
                _ = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        tracing::info!("link watcher stopping");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_message(&mut self, msg: NetlinkMessage<RouteNetlinkMessage>) {
        let event = match msg.payload {
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::NewLink(link)) => {
                self.on_new_link(&link)
            }
            NetlinkPayload::InnerMessage(RouteNetlinkMessage::DelLink(link)) => {
                self.on_del_link(&link)
            }
            _ => None,
        };

        if let Some(event) = event {
            tracing::info!(
                interface = %event.interface,
                kind = ?event.kind,
                operstate = %event.operstate,
                "link event"
            );
            if self.tx.send(event).await.is_err() {
                tracing::warn!("link event channel closed");
            }
        }
    }

    fn on_new_link(&mut self, msg: &LinkMessage) -> Option<LinkEvent> {
        let (name, operstate) = link_attrs(msg);
        let name = name?;
        if !self.filter.matches(&name) {
            return None;
        }

        let kind = match self.previous_states.get(&name).map(String::as_str) {
            None => LinkEventKind::Added,
            Some(prev) if operstate == "up" && prev != "up" => LinkEventKind::Up,
            Some("up") if operstate != "up" => LinkEventKind::Down,
            Some(_) => return None, // unchanged
        };

        self.previous_states.insert(name.clone(), operstate.into());

        Some(LinkEvent {
            interface: name,
            ifindex: msg.header.index,
            kind,
            operstate: operstate.into(),
            flags: msg.header.flags.bits(),
            timestamp: Utc::now(),
        })
    }

    fn on_del_link(&mut self, msg: &LinkMessage) -> Option<LinkEvent> {
        let (name, _) = link_attrs(msg);
        let name = name?;
        if !self.filter.matches(&name) {
            return None;
        }
        self.previous_states.remove(&name)?;

        Some(LinkEvent {
            interface: name,
            ifindex: msg.header.index,
            kind: LinkEventKind::Removed,
            operstate: "notpresent".into(),
            flags: msg.header.flags.bits(),
            timestamp: Utc::now(),
        })
    }
}

/// One-shot dump of current interface operstates.
pub async fn snapshot(
    handle: &rtnetlink::Handle,
    filter: &InterfaceFilter,
) -> HashMap<String, String> {
    let mut states = HashMap::new();
    let mut links = handle.link().get().execute();

    loop {
        match links.try_next().await {
            Ok(Some(msg)) => {
                let (name, operstate) = link_attrs(&msg);
                if let Some(name) = name {
                    if filter.matches(&name) {
                        states.insert(name, operstate.to_string());
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "link dump error");
                tokio::time::sleep(Duration::from_millis(200)).await;
                break;
            }
        }
    }

    states
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_message(name: &str, state: State, index: u32) -> LinkMessage {
        let mut msg = LinkMessage::default();
        msg.header.index = index;
        msg.attributes.push(LinkAttribute::IfName(name.into()));
        msg.attributes.push(LinkAttribute::OperState(state));
        msg
    }

    fn watcher() -> (LinkWatcher, mpsc::Receiver<LinkEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx); // edge detection is exercised directly, no run loop
        (
            LinkWatcher::new(InterfaceFilter::default(), tx, shutdown_rx),
            rx,
        )
    }

    #[test]
    fn new_interface_is_added() {
        let (mut w, _rx) = watcher();
        let event = w.on_new_link(&link_message("eth0", State::Up, 2)).unwrap();
        assert_eq!(event.kind, LinkEventKind::Added);
        assert_eq!(event.operstate, "up");
        assert_eq!(event.ifindex, 2);
    }

    #[test]
    fn up_down_transitions() {
        let (mut w, _rx) = watcher();
        w.on_new_link(&link_message("eth0", State::Down, 2));

        let up = w.on_new_link(&link_message("eth0", State::Up, 2)).unwrap();
        assert_eq!(up.kind, LinkEventKind::Up);

        let down = w
            .on_new_link(&link_message("eth0", State::LowerLayerDown, 2))
            .unwrap();
        assert_eq!(down.kind, LinkEventKind::Down);
        assert_eq!(down.operstate, "lowerlayerdown");
    }

    #[test]
    fn unchanged_state_is_silent() {
        let (mut w, _rx) = watcher();
        w.on_new_link(&link_message("eth0", State::Up, 2));
        assert!(w.on_new_link(&link_message("eth0", State::Up, 2)).is_none());
        // down -> dormant: both non-up, still no event
        w.on_new_link(&link_message("eth1", State::Down, 3));
        assert!(w
            .on_new_link(&link_message("eth1", State::Dormant, 3))
            .is_none());
    }

    #[test]
    fn excluded_interfaces_are_filtered() {
        let (mut w, _rx) = watcher();
        assert!(w.on_new_link(&link_message("docker0", State::Up, 5)).is_none());
        assert!(w.on_new_link(&link_message("lo", State::Up, 1)).is_none());
    }

    #[test]
    fn removed_interface_emits_once() {
        let (mut w, _rx) = watcher();
        w.on_new_link(&link_message("eth0", State::Up, 2));

        let removed = w.on_del_link(&link_message("eth0", State::Down, 2)).unwrap();
        assert_eq!(removed.kind, LinkEventKind::Removed);
        // Second delete for an unknown interface is silent
        assert!(w.on_del_link(&link_message("eth0", State::Down, 2)).is_none());
    }
}
