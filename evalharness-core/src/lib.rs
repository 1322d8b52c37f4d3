// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # Evalharness Core
//!
//! Entities shared by every part of the evaluation engine: connector and
//! metric configuration, the configuration store, evaluation records and
//! connector responses.

pub mod config;
pub mod connector;
pub mod error;
pub mod record;

pub use config::{
    ConfigStore, ConnectorConfig, HarnessConfig, MetricConfig, RunnerSettings,
    DEFAULT_CONNECTOR_TIMEOUT_SECS,
};
pub use connector::{ChatMessage, ChatRole, ConnectorResponse, Prompt};
pub use error::{CoreError, CoreResult};
pub use record::{load_records, parse_records, AggregateResult, EvaluationDetail, EvaluationRecord};
