//! Core types shared by every phase of a migration.
//!
//! - [`record`]: source records, their classification and target documents
//! - [`filter`]: field filters for target queries
//! - [`traits`]: the source API and target system seams
//! - [`report`]: severities and recommendations used by phase reports

pub mod filter;
pub mod record;
pub mod report;
pub mod traits;

pub use filter::{Condition, Filter};
pub use record::{
    decimal_value, doc_date, doc_decimal, doc_rows, doc_str, doc_timestamp, docstatus,
    value_decimal, Direction, Document, EntityType, ExternalRecord, Mutation, RecordLine,
    DOCSTATUS_CANCELLED, DOCSTATUS_DRAFT, DOCSTATUS_SUBMITTED,
};
pub use report::{percentage, Priority, Recommendation, Severity};
pub use traits::{header_value, ApiResponse, SourceApi, TargetSystem};
