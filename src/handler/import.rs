use email_address::EmailAddress;
use tracing::{info, instrument};

use crate::handler::{Handlers, repo_error};
use crate::models::{ImportJobId, ImportStatus};
use crate::queue::HandlerError;

impl Handlers {
    /// Parse an uploaded CSV and upsert its rows as contacts. Re-running
    /// a half-finished job is harmless: rows are keyed by
    /// (audience, email), so already-imported contacts are refreshed
    /// rather than duplicated.
    #[instrument(skip(self), fields(import_job_id = %job_id))]
    pub(super) async fn handle_import(&self, job_id: ImportJobId) -> Result<(), HandlerError> {
        let job = self.import_jobs.get(job_id).await.map_err(repo_error)?;

        if job.status == ImportStatus::Completed {
            return Ok(());
        }

        self.import_jobs
            .update_status(job.id, ImportStatus::Processing)
            .await
            .map_err(repo_error)?;

        let table = match parse_csv(&job.csv_data) {
            Ok(table) => table,
            Err(reason) => {
                self.import_jobs
                    .finish(job.id, ImportStatus::Failed, 0, 0, 0, Some(&reason))
                    .await
                    .map_err(repo_error)?;
                return Err(HandlerError::permanent(reason));
            }
        };

        let email_col = table.column("email").ok_or_else(|| {
            HandlerError::permanent("csv is missing the required email column")
        })?;
        let first_name_col = table.column("first_name");
        let last_name_col = table.column("last_name");

        let total = table.rows.len() as i32;
        let mut imported = 0;
        let mut failed = 0;

        for row in &table.rows {
            let Some(email) = row.get(email_col).map(|e| e.trim()) else {
                failed += 1;
                continue;
            };
            if email.parse::<EmailAddress>().is_err() {
                failed += 1;
                continue;
            }

            let first_name = first_name_col.and_then(|i| row.get(i)).map(|s| s.trim());
            let last_name = last_name_col.and_then(|i| row.get(i)).map(|s| s.trim());

            match self
                .contacts
                .upsert(job.audience_id, email, first_name, last_name)
                .await
            {
                Ok(_) => imported += 1,
                Err(_) => failed += 1,
            }
        }

        self.import_jobs
            .finish(job.id, ImportStatus::Completed, total, imported, failed, None)
            .await
            .map_err(repo_error)?;

        info!(total, imported, failed, "contact import finished");
        Ok(())
    }
}

pub(super) struct CsvTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl CsvTable {
    /// Index of a named column, case-insensitive.
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(name))
    }
}

/// A small RFC 4180 reader: quoted fields, doubled-quote escapes, CRLF
/// or LF records. The first record is the header.
pub(super) fn parse_csv(input: &str) -> Result<CsvTable, String> {
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                other => field.push(other),
            }
            continue;
        }

        match c {
            '"' => {
                if field.is_empty() {
                    in_quotes = true;
                } else {
                    return Err("unexpected quote inside unquoted field".to_string());
                }
            }
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            other => field.push(other),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    // a trailing blank line is not a record
    records.retain(|r| !(r.len() == 1 && r[0].is_empty()));

    let mut iter = records.into_iter();
    let header = iter.next().ok_or_else(|| "csv is empty".to_string())?;

    Ok(CsvTable {
        header,
        rows: iter.collect(),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plain_rows_parse() {
        let table = parse_csv("email,first_name,last_name\na@x.com,Ada,Lovelace\nb@y.com,,\n")
            .unwrap();

        assert_eq!(table.header, vec!["email", "first_name", "last_name"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0], vec!["a@x.com", "Ada", "Lovelace"]);
        assert_eq!(table.rows[1], vec!["b@y.com", "", ""]);
    }

    #[test]
    fn quoted_fields_keep_commas_and_quotes() {
        let table = parse_csv("email,first_name\na@x.com,\"Lovelace, Ada\"\nb@y.com,\"say \"\"hi\"\"\"\n")
            .unwrap();

        assert_eq!(table.rows[0][1], "Lovelace, Ada");
        assert_eq!(table.rows[1][1], "say \"hi\"");
    }

    #[test]
    fn crlf_records_parse() {
        let table = parse_csv("email\r\na@x.com\r\nb@y.com\r\n").unwrap();
        assert_eq!(table.rows.len(), 2);
    }

    #[test]
    fn column_lookup_is_case_insensitive() {
        let table = parse_csv("Email,FIRST_NAME\na@x.com,Ada\n").unwrap();
        assert_eq!(table.column("email"), Some(0));
        assert_eq!(table.column("first_name"), Some(1));
        assert_eq!(table.column("last_name"), None);
    }

    #[test]
    fn unterminated_quotes_error() {
        assert!(parse_csv("email\n\"unclosed\n").is_err());
    }

    #[test]
    fn empty_input_errors() {
        assert!(parse_csv("").is_err());
    }

    #[test]
    fn final_record_without_newline_counts() {
        let table = parse_csv("email\na@x.com").unwrap();
        assert_eq!(table.rows, vec![vec!["a@x.com"]]);
    }
}
