pub mod counters;
pub mod make_url;
