//! Resource metering and credit accounting.

mod balance;
mod report;
mod reports;

pub use balance::{BalanceStore, Conversion};
pub use report::{
    DeductOpt, MeteringMode, MeteringReport, MeteringReportStep, Report, ReportLabels, ReportStep,
    ReportStepDetail, COMPUTE_RESOURCE, SPEND_RATIOS_KEY,
};
pub use reports::Reports;
