use std::env;

use emrtd_eac::{bytes2hex, util::unwrap_do, AuthEvent, BacKeySpec, EacError, PassportService};
use openssl::pkey::PKey;
use tracing::{error, info, warn};

fn main() -> Result<(), EacError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .init();

    // Establish a PC/SC context.
    let ctx = match pcsc::Context::establish(pcsc::Scope::User) {
        Ok(ctx) => ctx,
        Err(err) => {
            error!("Failed to establish context: {err}");
            std::process::exit(1);
        }
    };

    // List available readers.
    let mut readers_buf = [0; 2048];
    let mut readers = match ctx.list_readers(&mut readers_buf) {
        Ok(readers) => readers,
        Err(err) => {
            error!("Failed to list readers: {err}");
            std::process::exit(1);
        }
    };

    // Use the first reader.
    let Some(reader) = readers.next() else {
        error!("No readers are connected.");
        std::process::exit(1);
    };
    info!("Using reader: {reader:?}");

    // Connect to the card.
    let card = match ctx.connect(reader, pcsc::ShareMode::Shared, pcsc::Protocols::ANY) {
        Ok(card) => card,
        Err(pcsc::Error::NoSmartcard) => {
            error!("A smartcard is not present in the reader.");
            std::process::exit(1);
        }
        Err(err) => {
            error!("Failed to connect to card: {err}");
            std::process::exit(1);
        }
    };

    let service: PassportService<pcsc::Card> =
        PassportService::new(card).with_event_sink(Box::new(|event| match event {
            AuthEvent::Bac(bac) => info!(
                "BAC session started with SSC {:016X}",
                bac.wrapper.send_sequence_counter()
            ),
            AuthEvent::Aa(aa) => info!(
                "AA challenge {} verified: {}",
                bytes2hex(&aa.challenge),
                aa.success
            ),
            other => info!("{other:?}"),
        }));

    if let Some(atr) = service.atr() {
        info!("ATR from attribute: {}", bytes2hex(&atr));
    }

    // Selects the eMRTD application.
    service.open()?;

    let doc_no = env::var("DOCNO").expect("Please set DOCNO environment variable");
    let birthdate = env::var("BIRTHDATE").expect("Please set BIRTHDATE environment variable");
    let expirydate = env::var("EXPIRYDATE").expect("Please set EXPIRYDATE environment variable");

    service.do_bac(&BacKeySpec::new(&doc_no, &birthdate, &expirydate)?)?;

    // Read EF.COM
    let ef_com = service.read_file(0x011E)?;
    info!("Data from the EF.COM: {}", bytes2hex(&ef_com));

    // Read EF.SOD
    let ef_sod = service.read_file(0x011D)?;
    info!("Data from the EF.SOD: {}", bytes2hex(&ef_sod));

    // Read EF.DG1
    let ef_dg1 = service.read_file(0x0101)?;
    info!("Data from the EF.DG1: {}", bytes2hex(&ef_dg1));

    // Active Authentication with the key from EF.DG15, if the document has one.
    match service.read_file(0x010F) {
        Ok(ef_dg15) => {
            let public_key = PKey::public_key_from_der(unwrap_do(&[0x6F], &ef_dg15)?)?;
            if service.do_aa(&public_key)? {
                info!("Active Authentication succeeded");
            } else {
                warn!("Active Authentication failed, the chip may be cloned");
            }
        }
        Err(EacError::FileNotFound(_)) => info!("EF.DG15 not present, skipping Active Authentication"),
        Err(err) => return Err(err),
    }

    service.close();
    Ok(())
}
