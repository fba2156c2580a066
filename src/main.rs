fn main() -> anyhow::Result<()> {
    vat_invoice_lib::run()
}
