// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! The [`NetworkGraph`] stores the channel topology learned from gossip, merging in the
//! caller's own channels (which may not have been announced) on every read.

use bitcoin::secp256k1::constants::PUBLIC_KEY_SIZE;
use bitcoin::secp256k1::PublicKey;

use crate::util::logger::Logger;
use crate::util::scid_utils::ShortChannelId;

use core::cmp;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard};

/// Represents the compressed public key of a node
#[derive(Clone, Copy)]
pub struct NodeId([u8; PUBLIC_KEY_SIZE]);

impl NodeId {
	/// Create a new NodeId from a public key
	pub fn from_pubkey(pubkey: &PublicKey) -> Self {
		NodeId(pubkey.serialize())
	}

	/// Get the public key slice from this NodeId
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "NodeId({})", log_bytes!(self.0))
	}
}
impl fmt::Display for NodeId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", log_bytes!(self.0))
	}
}

impl core::hash::Hash for NodeId {
	fn hash<H: core::hash::Hasher>(&self, hasher: &mut H) {
		self.0.hash(hasher);
	}
}

impl Eq for NodeId {}

impl PartialEq for NodeId {
	fn eq(&self, other: &Self) -> bool {
		self.0[..] == other.0[..]
	}
}

impl cmp::PartialOrd for NodeId {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for NodeId {
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		self.0[..].cmp(&other.0[..])
	}
}

/// The feature bits a node announced, as a raw BOLT 9 bitfield.
///
/// Only read at route-construction time; a [`crate::routing::router::RouteEdge`] carries the
/// features of the node it arrives at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct NodeFeatures(u64);

impl NodeFeatures {
	/// `var_onion_optin` as a required feature (BOLT 9 bit 8).
	pub const VAR_ONION_REQUIRED: u64 = 1 << 8;
	/// `var_onion_optin` as an optional feature (BOLT 9 bit 9).
	pub const VAR_ONION_OPTIONAL: u64 = 1 << 9;

	/// A feature set with no bits set.
	pub fn empty() -> Self {
		NodeFeatures(0)
	}

	/// Builds a feature set from a raw bitfield.
	pub fn from_bits(bits: u64) -> Self {
		NodeFeatures(bits)
	}

	/// The raw bitfield.
	pub fn bits(&self) -> u64 {
		self.0
	}

	/// Whether the node can process variable-length onion payloads, required or optional.
	pub fn supports_variable_length_onion(&self) -> bool {
		self.0 & (Self::VAR_ONION_REQUIRED | Self::VAR_ONION_OPTIONAL) != 0
	}
}

/// Fees for routing via a given channel or a node
#[derive(Eq, PartialEq, Copy, Clone, Debug, Hash)]
pub struct RoutingFees {
	/// Flat routing fee in millisatoshis.
	pub base_msat: u32,
	/// Liquidity-based routing fee in millionths of a routed amount.
	/// In other words, 10000 is 1%.
	pub proportional_millionths: u32,
}

/// Details about one direction of a channel, as published by the node forwards in that
/// direction originate from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelUpdateInfo {
	/// When the last update to the channel direction was issued.
	/// Value is opaque, as set in the update.
	pub last_update: u32,
	/// Whether the channel can be currently used for payments (in this one direction).
	pub enabled: bool,
	/// The difference in CLTV values that you must have when routing through this channel.
	pub cltv_expiry_delta: u16,
	/// The minimum value, which must be relayed to the next hop via the channel
	pub htlc_minimum_msat: u64,
	/// The maximum value which may be relayed to the next hop via the channel, if the update
	/// advertised one.
	pub htlc_maximum_msat: Option<u64>,
	/// Fees charged when the channel is used for routing
	pub fees: RoutingFees,
}

impl fmt::Display for ChannelUpdateInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		write!(f, "last_update {}, enabled {}, cltv_expiry_delta {}, htlc_minimum_msat {}, fees {:?}",
			self.last_update, self.enabled, self.cltv_expiry_delta, self.htlc_minimum_msat, self.fees)?;
		Ok(())
	}
}

/// Details about a channel (both directions).
///
/// The endpoints are stored in canonical (lexicographic) order; a direction is usable only if
/// the node forwards originate from has published a policy for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
	/// Source node of the first direction of a channel
	pub node_one: NodeId,
	/// Details about the first direction of a channel
	pub one_to_two: Option<ChannelUpdateInfo>,
	/// Source node of the second direction of a channel
	pub node_two: NodeId,
	/// Details about the second direction of a channel
	pub two_to_one: Option<ChannelUpdateInfo>,
	/// The channel capacity as seen on-chain, if chain lookup is available.
	pub capacity_sats: Option<u64>,
}

impl ChannelInfo {
	/// Returns the policy governing forwards originating at `source`, if `source` is an
	/// endpoint of this channel and has published one.
	pub fn policy_published_by(&self, source: &NodeId) -> Option<&ChannelUpdateInfo> {
		if *source == self.node_one {
			self.one_to_two.as_ref()
		} else if *source == self.node_two {
			self.two_to_one.as_ref()
		} else {
			None
		}
	}

	/// Returns the counterparty of `node` on this channel, or `None` if `node` is not an
	/// endpoint of it.
	pub fn other_node(&self, node: &NodeId) -> Option<&NodeId> {
		if *node == self.node_one {
			Some(&self.node_two)
		} else if *node == self.node_two {
			Some(&self.node_one)
		} else {
			None
		}
	}
}

impl fmt::Display for ChannelInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		write!(f, "node_one: {}, one_to_two: {:?}, node_two: {}, two_to_one: {:?}, capacity_sats: {:?}",
			self.node_one, self.one_to_two, self.node_two, self.two_to_one, self.capacity_sats)?;
		Ok(())
	}
}

/// Information received in the latest node_announcement from this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAnnouncementInfo {
	/// Protocol features the node announced support for
	pub features: NodeFeatures,
}

/// Details about a node in the network, known from the network announcement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeInfo {
	/// All valid channels a node has announced
	pub channels: Vec<ShortChannelId>,
	/// More information about a node from node_announcement.
	/// Optional because we store a Node entry after learning about it from
	/// a channel announcement, but before receiving a node announcement.
	pub announcement_info: Option<NodeAnnouncementInfo>,
}

impl fmt::Display for NodeInfo {
	fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
		write!(f, "channels: {:?}, announcement_info: {:?}", self.channels, self.announcement_info)?;
		Ok(())
	}
}

/// A channel of our own, which the gossip pipeline may not (yet) know about.
///
/// Graph reads prefer this view for channels we own, and the liquidity predicates let a path
/// search refuse paths our current balances cannot carry.
pub trait LocalChannel {
	/// Both endpoints and the capacity of the channel, as known locally.
	fn channel_info(&self) -> ChannelInfo;
	/// The directional policy published by `source`, if known locally.
	fn policy_published_by(&self, source: &NodeId) -> Option<ChannelUpdateInfo>;
	/// Whether we can originate a payment of `amount_msat` on this channel right now.
	fn can_pay(&self, amount_msat: u64, check_frozen: bool) -> bool;
	/// Whether we can accept a payment of `amount_msat` on this channel right now.
	fn can_receive(&self, amount_msat: u64, check_frozen: bool) -> bool;
}

/// The caller's own channels, keyed by funding locator, consulted before the gossip view.
pub type LocalChannels<'a> = HashMap<ShortChannelId, &'a dyn LocalChannel>;

/// An error when applying a gossip-derived update to the graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphUpdateError {
	/// A channel's endpoints were not in canonical lexicographic order.
	NodesNotOrdered,
	/// The update references a channel the graph does not contain.
	UnknownChannel,
	/// The policy's source node is not an endpoint of the channel it claims to describe.
	UnknownSourceNode,
	/// The update is older than the last one processed for this channel direction.
	StaleUpdate,
}

impl fmt::Display for GraphUpdateError {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			GraphUpdateError::NodesNotOrdered => write!(f, "channel endpoints not in canonical order"),
			GraphUpdateError::UnknownChannel => write!(f, "no such channel"),
			GraphUpdateError::UnknownSourceNode => write!(f, "source node is not a channel endpoint"),
			GraphUpdateError::StaleUpdate => write!(f, "update older than last processed update"),
		}
	}
}

/// Represents the network as nodes and channels between them
///
/// Reads take the interior locks only for the duration of a single accessor call, so a running
/// path search never blocks gossip writers. A search racing a writer may observe a channel
/// appear or vanish between two calls; that costs it at worst a route, never its integrity.
/// Callers which need a consistent view should use [`NetworkGraph::read_only`].
pub struct NetworkGraph<L: Deref> where L::Target: Logger {
	logger: L,
	// Lock order: channels -> nodes
	channels: RwLock<BTreeMap<ShortChannelId, ChannelInfo>>,
	nodes: RwLock<BTreeMap<NodeId, NodeInfo>>,
	// Bumped on every mutation; the graph's identity token. The beacon cache discards all of
	// its precomputed state whenever this moves.
	version: AtomicU64,
}

/// A read-only view of [`NetworkGraph`].
pub struct ReadOnlyNetworkGraph<'a> {
	channels: RwLockReadGuard<'a, BTreeMap<ShortChannelId, ChannelInfo>>,
	nodes: RwLockReadGuard<'a, BTreeMap<NodeId, NodeInfo>>,
}

impl<L: Deref> NetworkGraph<L> where L::Target: Logger {
	/// Creates a new, empty `NetworkGraph`.
	pub fn new(logger: L) -> NetworkGraph<L> {
		NetworkGraph {
			logger,
			channels: RwLock::new(BTreeMap::new()),
			nodes: RwLock::new(BTreeMap::new()),
			version: AtomicU64::new(0),
		}
	}

	/// Returns a read-only view of the network graph.
	pub fn read_only(&'_ self) -> ReadOnlyNetworkGraph<'_> {
		let channels = self.channels.read().unwrap();
		let nodes = self.nodes.read().unwrap();
		ReadOnlyNetworkGraph {
			channels,
			nodes,
		}
	}

	/// The graph's identity token: any mutation moves it.
	pub fn version(&self) -> u64 {
		self.version.load(Ordering::Acquire)
	}

	fn bump_version(&self) {
		self.version.fetch_add(1, Ordering::Release);
	}

	/// The number of channels in the gossip view (not counting any local channels).
	pub fn num_channels(&self) -> usize {
		self.channels.read().unwrap().len()
	}

	/// The number of nodes in the gossip view.
	pub fn num_nodes(&self) -> usize {
		self.nodes.read().unwrap().len()
	}

	/// All node ids currently known, in id order.
	pub fn list_nodes(&self) -> Vec<NodeId> {
		self.nodes.read().unwrap().keys().cloned().collect()
	}

	/// Returns the gossip view of `node_id`, if known.
	pub fn node(&self, node_id: &NodeId) -> Option<NodeInfo> {
		self.nodes.read().unwrap().get(node_id).cloned()
	}

	/// The features `node_id` announced, or an empty set for unannounced nodes.
	pub fn node_features(&self, node_id: &NodeId) -> NodeFeatures {
		self.nodes.read().unwrap().get(node_id)
			.and_then(|node| node.announcement_info.as_ref())
			.map(|info| info.features)
			.unwrap_or_else(NodeFeatures::empty)
	}

	/// All channels incident to `node_id` which a path search may consider: the gossip view
	/// plus any of the caller's own channels touching the node, deduplicated.
	pub fn channels_for_node(&self, node_id: &NodeId, local_channels: &LocalChannels) -> Vec<ShortChannelId> {
		let mut scids = self.nodes.read().unwrap().get(node_id)
			.map(|node| node.channels.clone()).unwrap_or_else(Vec::new);
		// Map iteration order is unstable; sort the merged-in channels so repeated searches
		// explore edges in the same order.
		let mut local_scids: Vec<ShortChannelId> = local_channels.iter()
			.filter(|&(scid, local_channel)| {
				!scids.contains(scid) && local_channel.channel_info().other_node(node_id).is_some()
			})
			.map(|(scid, _)| *scid).collect();
		local_scids.sort();
		scids.extend(local_scids);
		scids
	}

	/// Returns the channel with the given id, preferring the caller's local view for channels
	/// the caller owns.
	pub fn channel(&self, short_channel_id: &ShortChannelId, local_channels: &LocalChannels) -> Option<ChannelInfo> {
		if let Some(local_channel) = local_channels.get(short_channel_id) {
			return Some(local_channel.channel_info());
		}
		self.channels.read().unwrap().get(short_channel_id).cloned()
	}

	/// Returns the policy published by `source` for the given channel, i.e. the one governing
	/// forwards originating at `source`, preferring the caller's local view.
	pub fn policy(&self, short_channel_id: &ShortChannelId, source: &NodeId, local_channels: &LocalChannels)
		-> Option<ChannelUpdateInfo>
	{
		if let Some(local_channel) = local_channels.get(short_channel_id) {
			return local_channel.policy_published_by(source);
		}
		self.channels.read().unwrap().get(short_channel_id)
			.and_then(|channel| channel.policy_published_by(source)).cloned()
	}

	/// Stores a channel learned from a channel announcement. `node_one` must sort before
	/// `node_two`, as on the wire.
	///
	/// If the channel is already known with the same endpoints, only the capacity is
	/// refreshed and existing directional policies are kept. A re-announcement with different
	/// endpoints replaces the previous channel wholesale (as after a reorg).
	pub fn add_channel(&self, short_channel_id: ShortChannelId, node_one: NodeId, node_two: NodeId,
		capacity_sats: Option<u64>) -> Result<(), GraphUpdateError>
	{
		if node_one >= node_two {
			return Err(GraphUpdateError::NodesNotOrdered);
		}

		let mut channels = self.channels.write().unwrap();
		let mut nodes = self.nodes.write().unwrap();
		match channels.entry(short_channel_id) {
			std::collections::btree_map::Entry::Occupied(mut entry) => {
				let existing = entry.get_mut();
				if existing.node_one == node_one && existing.node_two == node_two {
					log_gossip!(self.logger, "Refreshing known channel {} capacity to {:?}", short_channel_id, capacity_sats);
					existing.capacity_sats = capacity_sats;
				} else {
					log_gossip!(self.logger, "Replacing channel {} with new endpoints", short_channel_id);
					let previous = existing.clone();
					*existing = ChannelInfo {
						node_one, one_to_two: None, node_two, two_to_one: None, capacity_sats,
					};
					Self::remove_channel_in_nodes(&mut nodes, &previous, short_channel_id);
					Self::add_channel_to_node(&mut nodes, node_one, short_channel_id);
					Self::add_channel_to_node(&mut nodes, node_two, short_channel_id);
				}
			},
			std::collections::btree_map::Entry::Vacant(entry) => {
				log_gossip!(self.logger, "Adding channel {} between nodes {} and {}", short_channel_id, node_one, node_two);
				entry.insert(ChannelInfo {
					node_one, one_to_two: None, node_two, two_to_one: None, capacity_sats,
				});
				Self::add_channel_to_node(&mut nodes, node_one, short_channel_id);
				Self::add_channel_to_node(&mut nodes, node_two, short_channel_id);
			},
		}
		core::mem::drop(nodes);
		core::mem::drop(channels);
		self.bump_version();
		Ok(())
	}

	/// Applies a directional policy published by `source` to a known channel. The direction is
	/// implied by which endpoint `source` is.
	pub fn update_channel_policy(&self, short_channel_id: &ShortChannelId, source: &NodeId,
		update: ChannelUpdateInfo) -> Result<(), GraphUpdateError>
	{
		let mut channels = self.channels.write().unwrap();
		let channel = match channels.get_mut(short_channel_id) {
			Some(channel) => channel,
			None => return Err(GraphUpdateError::UnknownChannel),
		};
		let direction = if *source == channel.node_one {
			&mut channel.one_to_two
		} else if *source == channel.node_two {
			&mut channel.two_to_one
		} else {
			return Err(GraphUpdateError::UnknownSourceNode);
		};
		if let Some(existing) = direction.as_ref() {
			if existing.last_update >= update.last_update {
				log_gossip!(self.logger, "Ignoring update for channel {} older than last processed update", short_channel_id);
				return Err(GraphUpdateError::StaleUpdate);
			}
		}
		log_gossip!(self.logger, "Updating channel {} in direction from {} with {}", short_channel_id, source, update);
		*direction = Some(update);
		core::mem::drop(channels);
		self.bump_version();
		Ok(())
	}

	/// Stores the announced features for a node, creating its entry if the node is not yet
	/// known from any channel.
	pub fn add_or_update_node(&self, node_id: NodeId, features: NodeFeatures) {
		let mut nodes = self.nodes.write().unwrap();
		log_gossip!(self.logger, "Updating node {} with feature bits {:#x}", node_id, features.bits());
		nodes.entry(node_id).or_insert(NodeInfo {
			channels: Vec::new(),
			announcement_info: None,
		}).announcement_info = Some(NodeAnnouncementInfo { features });
		core::mem::drop(nodes);
		self.bump_version();
	}

	/// Removes a channel from the graph, e.g. after a permanent routing failure or a spend of
	/// the funding output. Unannounced nodes left without channels are dropped with it.
	pub fn remove_channel(&self, short_channel_id: &ShortChannelId) {
		let mut channels = self.channels.write().unwrap();
		if let Some(channel) = channels.remove(short_channel_id) {
			log_trace!(self.logger, "Removing channel {} from the graph", short_channel_id);
			let mut nodes = self.nodes.write().unwrap();
			Self::remove_channel_in_nodes(&mut nodes, &channel, *short_channel_id);
			core::mem::drop(nodes);
			core::mem::drop(channels);
			self.bump_version();
		}
	}

	fn add_channel_to_node(nodes: &mut BTreeMap<NodeId, NodeInfo>, node_id: NodeId, short_channel_id: ShortChannelId) {
		let node = nodes.entry(node_id).or_insert(NodeInfo {
			channels: Vec::new(),
			announcement_info: None,
		});
		if !node.channels.contains(&short_channel_id) {
			node.channels.push(short_channel_id);
		}
	}

	fn remove_channel_in_nodes(nodes: &mut BTreeMap<NodeId, NodeInfo>, channel: &ChannelInfo, short_channel_id: ShortChannelId) {
		macro_rules! remove_from_node {
			($node_id: expr) => {
				if let std::collections::btree_map::Entry::Occupied(mut entry) = nodes.entry($node_id) {
					entry.get_mut().channels.retain(|scid| *scid != short_channel_id);
					if entry.get().channels.is_empty() && entry.get().announcement_info.is_none() {
						entry.remove_entry();
					}
				} else {
					panic!("Had channel with unknown node (usually an implementation error)");
				}
			};
		}

		remove_from_node!(channel.node_one);
		remove_from_node!(channel.node_two);
	}
}

impl ReadOnlyNetworkGraph<'_> {
	/// Returns all known valid channels
	pub fn channels(&self) -> &BTreeMap<ShortChannelId, ChannelInfo> {
		&*self.channels
	}

	/// Returns all known nodes
	pub fn nodes(&self) -> &BTreeMap<NodeId, NodeInfo> {
		&*self.nodes
	}
}
