use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One purchased item on a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub price: f64,
}

/// Extracted ticket fields as persisted by the upstream ingestion pipeline.
/// This core only reads them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub merchant_name: Option<String>,
    pub transaction_date: Option<NaiveDate>,
    pub total_amount: Option<f64>,
    pub items: Vec<LineItem>,
    pub category: Option<String>,
}

/// Admin-corrected expected values for one ticket, used by the ingestion
/// metric family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthRecord {
    pub ticket_id: i64,
    pub merchant_name: Option<String>,
    pub transaction_date: Option<String>,
    pub total_amount: Option<f64>,
    #[serde(default)]
    pub items: Vec<LineItem>,
}
