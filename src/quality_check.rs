use log::warn;

use crate::models::{ContactType, QualitySummary, ResultRow};

const IPHONE_LOW_PCT: f64 = 30.0;
const IPHONE_HIGH_PCT: f64 = 70.0;
const ERROR_HIGH_PCT: f64 = 10.0;

/// Computes the advisory completion-quality breakdown (§7) and logs a
/// warning if the distribution looks off. Never changes File status —
/// purely informational.
pub fn check(file_id: &str, results: &[ResultRow]) -> QualitySummary {
    let total = results.len() as f64;
    if total == 0.0 {
        let summary = QualitySummary {
            iphone_pct: 0.0,
            android_pct: 0.0,
            unknown_pct: 0.0,
            error_pct: 0.0,
        };
        return summary;
    }

    let mut iphone = 0u64;
    let mut android = 0u64;
    let mut unknown = 0u64;
    let mut error = 0u64;

    for row in results {
        match row.contact_type {
            ContactType::IPhone => iphone += 1,
            ContactType::Android => android += 1,
            ContactType::Unknown => unknown += 1,
            ContactType::Error => error += 1,
        }
    }

    let summary = QualitySummary {
        iphone_pct: pct(iphone, total),
        android_pct: pct(android, total),
        unknown_pct: pct(unknown, total),
        error_pct: pct(error, total),
    };

    if summary.iphone_pct < IPHONE_LOW_PCT || summary.iphone_pct > IPHONE_HIGH_PCT {
        warn!(
            "file {file_id} completed with unusual iPhone share: {:.2}%",
            summary.iphone_pct
        );
    }
    if summary.error_pct > ERROR_HIGH_PCT {
        warn!(
            "file {file_id} completed with high error rate: {:.2}%",
            summary.error_pct
        );
    }

    summary
}

fn pct(count: u64, total: f64) -> f64 {
    ((count as f64 / total) * 100.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(contact_type: ContactType) -> ResultRow {
        ResultRow {
            file_id: "f1".to_string(),
            phone_number: "555".to_string(),
            e164: "+1555".to_string(),
            is_ios: contact_type == ContactType::IPhone,
            supports_imessage: contact_type == ContactType::IPhone,
            supports_sms: matches!(contact_type, ContactType::IPhone | ContactType::Android),
            contact_type,
            error: None,
            from_cache: false,
        }
    }

    #[test]
    fn computes_expected_percentages() {
        let rows = vec![
            row(ContactType::IPhone),
            row(ContactType::IPhone),
            row(ContactType::Android),
            row(ContactType::Unknown),
        ];
        let summary = check("f1", &rows);
        assert_eq!(summary.iphone_pct, 50.0);
        assert_eq!(summary.android_pct, 25.0);
        assert_eq!(summary.unknown_pct, 25.0);
        assert_eq!(summary.error_pct, 0.0);
    }

    #[test]
    fn empty_results_yield_zeroed_summary() {
        let summary = check("f1", &[]);
        assert_eq!(summary.iphone_pct, 0.0);
    }
}
