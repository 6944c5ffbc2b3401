//! Statement anchors — statement date and amount due read from a bill PDF.
//!
//! Only these two fields are looked up in the document text. Extraction is
//! best effort: a document without extractable text has no anchors and is
//! archived under its original name.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use tracing::debug;

/// `Statement Date: MM/DD/YYYY`.
static STATEMENT_DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)statement\s+date:?\s*(\d{1,2})/(\d{1,2})/(\d{4})")
        .expect("statement date pattern is a valid regex")
});

/// `Amount Due: $1,234.56`, thousands separators optional.
static AMOUNT_DUE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)amount\s+due:?\s*\$?\s*(\d[\d,]*(?:\.\d{2})?)")
        .expect("amount due pattern is a valid regex")
});

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementAnchors {
    pub statement_date: Option<NaiveDate>,
    pub amount_due: Option<Decimal>,
}

impl StatementAnchors {
    /// First match of each anchor in `text`.
    pub fn find(text: &str) -> Self {
        let statement_date = STATEMENT_DATE_PATTERN.captures(text).and_then(|caps| {
            let month = caps.get(1)?.as_str().parse().ok()?;
            let day = caps.get(2)?.as_str().parse().ok()?;
            let year = caps.get(3)?.as_str().parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day)
        });
        let amount_due = AMOUNT_DUE_PATTERN
            .captures(text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| Decimal::from_str(&m.as_str().replace(',', "")).ok());

        Self {
            statement_date,
            amount_due,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.statement_date.is_none() && self.amount_due.is_none()
    }
}

/// Extract the document text off the async runtime and look up both anchors.
///
/// Returns `None` when the bytes are not a readable PDF.
pub async fn read_anchors(pdf: &[u8]) -> Option<StatementAnchors> {
    let bytes = pdf.to_vec();
    let extracted =
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await;

    match extracted {
        Ok(Ok(text)) => Some(StatementAnchors::find(&text)),
        Ok(Err(e)) => {
            debug!("No PDF text: {e}");
            None
        }
        // The extractor panics on some malformed documents.
        Err(e) => {
            debug!("PDF text extraction aborted: {e}");
            None
        }
    }
}

/// Archive file name for a statement dated `date`.
pub fn statement_file_name(date: NaiveDate) -> String {
    format!("{date}.pdf")
}


#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::fixture::statement_pdf;
    use super::*;

    #[test]
    fn finds_both_anchors_in_text() {
        let text = "Southern California Edison\nStatement Date: 9/15/2026\nTotal Amount Due: $1,234.56\n";
        let anchors = StatementAnchors::find(text);
        assert_eq!(anchors.statement_date, NaiveDate::from_ymd_opt(2026, 9, 15));
        assert_eq!(anchors.amount_due, Some(dec!(1234.56)));
    }

    #[test]
    fn anchors_are_independent() {
        let anchors = StatementAnchors::find("AMOUNT DUE $87");
        assert_eq!(anchors.statement_date, None);
        assert_eq!(anchors.amount_due, Some(dec!(87)));

        // Impossible calendar dates are not anchors.
        let anchors = StatementAnchors::find("Statement Date: 13/40/2026");
        assert!(anchors.is_empty());
    }

    #[tokio::test]
    async fn reads_anchors_from_pdf() {
        let pdf = statement_pdf(&[
            "Southern California Edison",
            "Statement Date: 09/15/2026",
            "Amount Due: $112.40",
        ]);

        let anchors = read_anchors(&pdf).await.unwrap();
        assert_eq!(anchors.statement_date, NaiveDate::from_ymd_opt(2026, 9, 15));
        assert_eq!(anchors.amount_due, Some(dec!(112.40)));
    }

    #[tokio::test]
    async fn unreadable_bytes_have_no_anchors() {
        assert_eq!(read_anchors(b"not a pdf").await, None);
    }

    #[test]
    fn file_name_is_iso_date() {
        let date = NaiveDate::from_ymd_opt(2026, 9, 15).unwrap();
        assert_eq!(statement_file_name(date), "2026-09-15.pdf");
    }
}
