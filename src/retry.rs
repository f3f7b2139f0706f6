/// Retries an idempotent store read with a linear backoff. Versioned writes never
/// go through here: a conflict must reach the caller so it can reload.
macro_rules! retry_store_read {
    ($context:expr, $operation:expr) => {{
        const MAX_ATTEMPTS: u32 = 3;
        const BASE_DELAY_MS: u64 = 250;

        let context_value: String = $context.into();
        let mut attempt = 1;

        loop {
            match ($operation).await {
                Ok(value) => break Ok(value),
                Err(err) if attempt >= MAX_ATTEMPTS => break Err(err),
                Err(err) => {
                    let delay_ms = BASE_DELAY_MS * u64::from(attempt);
                    log::warn!(
                        "Store read {} failed (attempt {}/{}): {}. Retrying in {}ms.",
                        context_value,
                        attempt,
                        MAX_ATTEMPTS,
                        err,
                        delay_ms
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }};
}

pub(crate) use retry_store_read;
