pub(crate) mod shared_file;
