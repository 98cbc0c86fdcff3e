//! Robust HTTP retrieval of the authority's CSV dumps.
//!
//! Retries transport failures and 5xx responses with exponential backoff,
//! never retries 4xx, and decodes payloads by trying the configured
//! candidate encodings in order.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::catalogue::DownloadConfig;
use crate::error::{PipelineError, Result};

/// A downloaded document, decoded to UTF-8 text.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub text: String,
    pub encoding: String,
    pub raw_len: usize,
}

pub struct Fetcher {
    client: reqwest::Client,
    config: DownloadConfig,
}

impl Fetcher {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| PipelineError::Network {
                url: String::new(),
                source: e,
            })?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// GET with retries; returns the raw payload bytes.
    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let mut attempt: u32 = 0;
        loop {
            let err: PipelineError = match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.bytes().await {
                            Ok(bytes) => return Ok(bytes.to_vec()),
                            Err(e) => PipelineError::Network {
                                url: url.to_string(),
                                source: e,
                            },
                        }
                    } else if status.is_client_error() {
                        // 4xx is terminal: the resource is wrong, not flaky.
                        return Err(PipelineError::Http {
                            url: url.to_string(),
                            status: status.as_u16(),
                        });
                    } else {
                        PipelineError::Http {
                            url: url.to_string(),
                            status: status.as_u16(),
                        }
                    }
                }
                Err(e) => PipelineError::Network {
                    url: url.to_string(),
                    source: e,
                },
            };

            if attempt >= self.config.max_retries {
                return Err(err);
            }
            let delay = retry_delay(self.config.retry_delay_seconds, attempt);
            warn!(url, attempt = attempt + 1, delay_s = delay, "retrying after {err}");
            sleep(Duration::from_secs_f64(delay)).await;
            attempt += 1;
        }
    }

    /// GET, decode against the candidate encodings, and run the structural
    /// check. This is the path used for CSV dumps.
    pub async fn get(&self, url: &str) -> Result<FetchedDocument> {
        let bytes = self.get_bytes(url).await?;
        let (text, encoding) = decode_with_candidates(&bytes, &self.config.candidate_encodings)
            .ok_or_else(|| PipelineError::Decode {
                url: url.to_string(),
            })?;
        check_csv_structure(&text)?;
        debug!(url, encoding = %encoding, bytes = bytes.len(), "download decoded");
        Ok(FetchedDocument {
            text,
            encoding,
            raw_len: bytes.len(),
        })
    }
}

/// Sleep before retry n+1 is `base × 2^n` seconds.
fn retry_delay(base_seconds: f64, retries_so_far: u32) -> f64 {
    base_seconds * f64::from(1u32 << retries_so_far.min(16))
}

/// Try each candidate encoding in order; the first that decodes without
/// replacement errors wins.
pub fn decode_with_candidates(bytes: &[u8], candidates: &[String]) -> Option<(String, String)> {
    for label in candidates {
        let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes()) else {
            warn!(label, "unknown encoding label in configuration");
            continue;
        };
        let (decoded, _, had_errors) = encoding.decode(bytes);
        if !had_errors {
            return Some((decoded.into_owned(), label.clone()));
        }
    }
    None
}

/// Minimal structural sanity: the payload must have a non-degenerate
/// header line and at least one data line.
pub fn check_csv_structure(text: &str) -> Result<()> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| PipelineError::InvalidCsv("document is empty".to_string()))?;
    if header.trim_matches(|c: char| c == ';' || c == ',' || c == '\t' || c == '"').is_empty() {
        return Err(PipelineError::InvalidCsv("header line is empty".to_string()));
    }
    if lines.next().is_none() {
        return Err(PipelineError::InvalidCsv("document has a header but no data".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<String> {
        vec!["utf-8".to_string(), "iso-8859-15".to_string()]
    }

    #[test]
    fn utf8_payload_decodes_as_utf8() {
        let (text, encoding) = decode_with_candidates("Periodo;Total\n2024T4;151,4\n".as_bytes(), &candidates()).unwrap();
        assert_eq!(encoding, "utf-8");
        assert!(text.contains("2024T4"));
    }

    #[test]
    fn latin_payload_falls_through_to_second_candidate() {
        // "Andalucía" in ISO-8859-15: the í byte is 0xED, invalid UTF-8 here.
        let bytes = b"Regi\xf3n;Total\n01 Andaluc\xeda;99\n";
        let (text, encoding) = decode_with_candidates(bytes, &candidates()).unwrap();
        assert_eq!(encoding, "iso-8859-15");
        assert!(text.contains("Andalucía"));
        assert!(text.contains("Región"));
    }

    #[test]
    fn undecodable_payload_yields_none() {
        let bytes = b"\xff\xfe\x00invalid";
        assert!(decode_with_candidates(bytes, &["utf-8".to_string()]).is_none());
    }

    #[test]
    fn structural_check_rejects_empty_documents() {
        assert!(check_csv_structure("").is_err());
        assert!(check_csv_structure("\n\n").is_err());
        assert!(check_csv_structure(";;;\n").is_err());
        assert!(check_csv_structure("Periodo;Total\n").is_err());
        assert!(check_csv_structure("Periodo;Total\n2024T4;151,4\n").is_ok());
    }

    #[test]
    fn retry_delay_doubles_per_attempt() {
        assert_eq!(retry_delay(2.0, 0), 2.0);
        assert_eq!(retry_delay(2.0, 1), 4.0);
        assert_eq!(retry_delay(2.0, 2), 8.0);
    }
}
