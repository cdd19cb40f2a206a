pub mod mail_record;
