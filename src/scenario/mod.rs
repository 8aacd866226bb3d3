// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Protocol scenarios driven against the shared event manager.
// Author: Lukas Bower

//! Scenario drivers.
//!
//! Each scenario submits its intent to the manager, polls within a
//! [`PollBudget`](crate::pacing::PollBudget) until its completion condition
//! holds, then checks the outcome with [`check!`](crate::check). Completion
//! state lives in the scenario's own handler and reaches the polling loop
//! over a channel.

pub mod http_client;
pub mod http_server;
pub mod mqtt;
