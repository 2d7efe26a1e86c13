//! Pipeline stages for hybrid extraction.
//!
//! Each submodule implements one step. The orchestrator in
//! [`crate::extract`] wires them together.
//!
//! ## Data Flow
//!
//! ```text
//! document ──▶ classify ──▶ client ──▶ validate ──▶ assemble
//!  (pdfium)   (TEXT/FORM)  (local or     (checks)   (TOC, order)
//!                           encode+VLM)
//! ```
//!
//! 1. [`document`]: open the PDF, inspect pages, render and read text; all
//!    pdfium calls are blocking and run in `spawn_blocking`
//! 2. [`classify`]: partition pages and estimate the cost of the run
//! 3. [`client`]: local text for TEXT pages, vision model for FORM pages,
//!    with retry/backoff; [`encode`] fits the page image under the payload
//!    ceiling and [`normalize`] cleans the model's answer
//! 4. [`validate`]: structural checks on one page of output
//! 5. [`assemble`]: metadata header, TOC and ordered page blocks, with
//!    [`format`] rewriting page bodies when canonical output is requested

pub mod assemble;
pub mod classify;
pub mod client;
pub mod document;
pub mod encode;
pub mod format;
pub mod normalize;
pub mod validate;
