pub(crate) mod redis;
