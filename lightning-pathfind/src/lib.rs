// This file is Copyright its original authors, visible in version control
// history.
//
// This file is licensed under the Apache License, Version 2.0 <LICENSE-APACHE
// or http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your option.
// You may not use this file except in accordance with one or both of these
// licenses.

//! Fee-aware payment path finding over a Lightning Network channel graph.
//!
//! A [`routing::gossip::NetworkGraph`] holds the channel topology as populated by a gossip
//! pipeline, a [`routing::router::PathFinder`] answers path queries over it, and the beacon
//! cache in [`routing::beacons`] amortizes repeated queries for similar amounts.
//!
//! The library does not execute payments and has no built-in threading or execution
//! environment: searches are pure, blocking compute, and it is up to the user to run them on a
//! compute-appropriate scheduler and to enforce any deadline via
//! [`routing::router::SearchInterrupt`].

#![cfg_attr(not(any(test, feature = "_test_utils")), deny(missing_docs))]
#![cfg_attr(not(any(test, feature = "_test_utils")), forbid(unsafe_code))]

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

extern crate bitcoin;

#[macro_use]
pub mod util;
pub mod routing;
