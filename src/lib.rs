//! # Try-on Stylist
//!
//! A conversational shopping assistant. Each chat message runs a fixed
//! pipeline: understand what the user wants, search a product catalog,
//! composite the top products onto a photo of the user, and rank the
//! composites against the user's visual preference profile.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────────────────────────┐   ┌──────────┐
//! │ HTTP/CLI │──▶│ Orchestrator                              │──▶│  SQLite  │
//! └──────────┘   │ context → research → style → ranking      │   │ threads  │
//!                └──┬──────────┬──────────┬──────────┬───────┘   │ users    │
//!                   ▼          ▼          ▼          ▼           └──────────┘
//!               ┌───────┐  ┌───────┐  ┌────────┐  ┌─────────┐
//!               │OpenAI │  │SerpApi│  │ Gemini │  │ S3 / fs │
//!               └───────┘  └───────┘  └────────┘  └─────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`similarity`] | Cosine similarity |
//! | [`embedding`] | Visual embeddings and color histograms |
//! | [`ranking`] | Weighted multi-facet ranking |
//! | [`filtering`] | Price/rating filters and sorting |
//! | [`store`] | Durable conversation state |
//! | [`users`] | User directory and preference enrollment |
//! | [`providers`] | LLM, search, image-merge, and storage clients |
//! | [`pipeline`] | The per-turn state machine |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod embedding;
pub mod filtering;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod ranking;
pub mod server;
pub mod similarity;
pub mod store;
pub mod users;
