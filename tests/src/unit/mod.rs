mod credential_file_tests;
mod session_tests;
