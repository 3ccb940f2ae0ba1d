//! FLSS Operations Backend
//!
//! Staff-facing REST service gluing the scan station to the commerce platform.
//!
//! ## Features
//! - Wholesale price lists with priority-ordered, time-windowed price rules
//! - Price resolution with legacy per-variant tier metafield fallback
//! - Draft order pricing reconciliation with fingerprint drift detection
//! - Shopify Admin client (client-credentials token cache)

use axum::http::StatusCode;
use thiserror::Error;

pub mod config;
pub mod domain;
pub mod pricing_service;
pub mod pricing_store;
pub mod reconcile;
pub mod shopify;

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Price list not found")]
    PriceListNotFound,

    #[error("Price rule not found")]
    PriceRuleNotFound,

    #[error("Draft order {0} not found")]
    DraftOrderNotFound(String),

    #[error("Order system not configured")]
    OrderSystemNotConfigured,

    #[error("Upstream request failed ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Store IO error: {0}")]
    StoreIo(#[from] std::io::Error),

    #[error("Store parse error: {0}")]
    StoreParse(#[from] serde_json::Error),
}

impl BackendError {
    /// HTTP status the error maps to at the route layer.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::PriceListNotFound | Self::PriceRuleNotFound | Self::DraftOrderNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::OrderSystemNotConfigured => StatusCode::NOT_IMPLEMENTED,
            Self::Upstream { .. } | Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::StoreIo(_) | Self::StoreParse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackendError>;
