// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![deny(unused_crate_dependencies)]
#![deny(unused_extern_crates)]

pub mod config;
pub mod error;
pub mod execute;
pub mod ids;
pub mod message;
pub mod ports;

pub use error::ValidationError;
pub use ids::{FunctionId, PeerId, RequestId};
