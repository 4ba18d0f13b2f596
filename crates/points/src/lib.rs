// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod buffer;
pub mod constants;
pub mod decoder;
pub mod errors;
pub mod flusher;
pub mod listener;
pub mod point;
pub mod telemetry;
pub mod util;
pub mod wavefront;
