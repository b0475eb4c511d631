mod monitor_tests;
mod registry_tests;
