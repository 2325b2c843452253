// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device lifecycle management.
//!
//! This module contains the gateway's core: the per-port
//! [`DeviceHandler`] state machine, the [`DeviceManager`] that
//! reconciles the managed set against the host's ports, and the
//! [`HealthReporter`] that aggregates identification failures.
//!
//! # Overview
//!
//! Devices attach and detach at runtime and never announce themselves
//! through an enumeration protocol. The manager therefore diffs the host's
//! port list against its managed set on every scan, and each handler infers
//! its device's type by sniffing the frames the device emits. Devices that
//! die silently are caught by the reap pass via per-handler activity
//! timestamps.

mod device_handler;
mod device_manager;
mod health;

pub use device_handler::{DeviceHandler, HandlerState, RemovedCallback};
pub use device_manager::DeviceManager;
pub use health::{HealthReporter, HealthStatus, PortFailures};
