// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Benjamin Chess
pub mod client;
pub mod dispatch;
pub mod doc;
pub mod handles;
pub mod metrics;
pub mod path;
pub mod refresh;
pub mod registry;
pub mod selfconfig;
pub mod server;
pub mod status;
pub mod store;
pub mod tree;
pub mod wire;

pub use client::Client;
pub use dispatch::{Origin, LOCAL_ORIGIN};
pub use doc::TreeDoc;
pub use server::Server;
pub use status::Status;
pub use store::{Store, StoreOptions};
