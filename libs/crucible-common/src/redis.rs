use uuid::Uuid;

/// Redis key and channel semantics - defines only naming, not runtime logic.
/// Keeps the store and bus adapters from drifting apart and makes every key
/// derivable from a job id alone.

pub const JOB_PREFIX: &str = "job";
pub const TOKEN_PREFIX: &str = "token";

/// Hash holding a job's metadata, status, and result.
pub fn job_key(job_id: &Uuid) -> String {
    format!("{}:{}", JOB_PREFIX, job_id)
}

/// Single-shot token binding its holder to one job.
pub fn token_key(token: &str) -> String {
    format!("{}:{}", TOKEN_PREFIX, token)
}

/// Channel carrying a job's streamed output chunks.
pub fn output_channel(job_id: &Uuid) -> String {
    format!("{}:{}:output", JOB_PREFIX, job_id)
}

/// Channel carrying a job's single terminal event.
pub fn complete_channel(job_id: &Uuid) -> String {
    format!("{}:{}:complete", JOB_PREFIX, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(job_key(&id), job_key(&id));
        assert!(job_key(&id).starts_with("job:"));
    }

    #[test]
    fn test_channel_names_contain_job_id() {
        let id = Uuid::new_v4();
        assert!(output_channel(&id).contains(&id.to_string()));
        assert!(output_channel(&id).ends_with(":output"));
        assert!(complete_channel(&id).ends_with(":complete"));
    }

    #[test]
    fn test_token_key_format() {
        assert_eq!(token_key("abc"), "token:abc");
    }
}
