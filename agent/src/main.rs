//! BarterWave trading agent
//!
//! Drives the offer server on behalf of a single user: make and answer
//! offers, settle downpayments, lock pickups and fetch receipts. The `auto`
//! command runs a simple decision engine over the offers waiting on the user.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "agent")]
#[command(about = "Trade on a BarterWave offer server")]
struct Cli {
    /// Offer server URL
    #[arg(long, env = "BARTERWAVE_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// User to act as
    #[arg(short, long, env = "BARTERWAVE_USER")]
    user: String,

    /// Act as a verified account
    #[arg(long, env = "BARTERWAVE_VERIFIED")]
    verified: bool,

    /// Act with the administrator role
    #[arg(long)]
    admin: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage listings
    #[command(subcommand)]
    Listing(ListingCommand),

    /// List offers you sent or received
    Offers {
        #[arg(long, value_enum)]
        direction: Option<Direction>,

        /// Only offers with this status (pending, countered, accepted, ...)
        #[arg(long)]
        status: Option<String>,

        /// Only offers on this listing
        #[arg(long)]
        listing: Option<String>,
    },

    /// Show one offer
    Show { id: String },

    /// Make an offer on a listing
    Offer {
        /// Target listing ID
        listing: String,

        #[command(flatten)]
        terms: TermsArgs,
    },

    /// Counter the terms waiting on you
    Counter {
        id: String,

        #[command(flatten)]
        terms: TermsArgs,
    },

    Accept { id: String },

    Reject { id: String },

    /// Retract terms you proposed
    Withdraw { id: String },

    /// Ask for more time on the running timer
    Extend {
        id: String,

        /// Minutes to add (server default if omitted)
        #[arg(short, long)]
        minutes: Option<i64>,
    },

    /// Settle the seller's downpayment
    #[command(subcommand)]
    Downpayment(DownpaymentCommand),

    /// Confirm the trade happened
    Confirm { id: String },

    /// Lock the deal for an in-person pickup
    Lock { id: String },

    /// Enter the buyer's pickup PIN (seller)
    VerifyPickup { id: String, pin: String },

    Dispute {
        id: String,

        #[arg(short, long)]
        reason: String,
    },

    /// Resolve a dispute (administrators)
    Resolve {
        id: String,

        #[arg(value_enum)]
        outcome: Outcome,

        #[arg(long)]
        note: Option<String>,
    },

    /// List open disputes (administrators)
    Disputes,

    Receipt { id: String },

    /// Show or change your seller settings
    #[command(subcommand)]
    Settings(SettingsCommand),

    /// Answer every offer waiting on you
    Auto {
        /// Accept offers carrying at least this much cash
        #[arg(long)]
        min_cash_cents: u64,

        /// Print decisions without acting on them
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum ListingCommand {
    Create {
        title: String,

        #[arg(long)]
        price_cents: i64,

        #[arg(long, default_value = "USD")]
        currency: String,

        #[arg(long, value_enum, default_value_t = Mode::Hybrid)]
        mode: Mode,
    },

    Show { id: String },
}

#[derive(Subcommand)]
enum DownpaymentCommand {
    /// Mark the downpayment as paid (buyer)
    Paid { id: String },
    /// Confirm the downpayment arrived (seller)
    Confirm { id: String },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show,
    Set {
        #[arg(long)]
        require_downpayment: bool,

        #[arg(long, value_enum, default_value_t = DownpaymentKind::Fixed)]
        downpayment_type: DownpaymentKind,

        /// Cents for a fixed downpayment, percent of the price otherwise
        #[arg(long, default_value_t = 0)]
        downpayment_value: i64,

        /// Minutes the other party has to respond
        #[arg(long, default_value_t = 60)]
        timer: i64,
    },
}

#[derive(Args)]
struct TermsArgs {
    /// Cash offered, in minor units
    #[arg(short, long)]
    cash: Option<i64>,

    /// One of your listings to trade, as LISTING_ID or LISTING_ID:QTY
    #[arg(short, long = "item", value_parser = parse_item)]
    items: Vec<ItemArg>,

    #[arg(long)]
    currency: Option<String>,

    #[arg(short, long)]
    message: Option<String>,
}

impl TermsArgs {
    fn to_json(&self) -> Value {
        json!({
            "offeredCashCents": self.cash,
            "offeredItems": self.items,
            "currencyCode": self.currency,
            "message": self.message,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemArg {
    listing_id: String,
    quantity: i64,
}

fn parse_item(raw: &str) -> Result<ItemArg, String> {
    let (listing_id, quantity) = match raw.split_once(':') {
        Some((id, qty)) => (id, qty.parse().map_err(|_| format!("bad quantity in {raw}"))?),
        None => (raw, 1),
    };
    if listing_id.is_empty() {
        return Err("listing ID must not be empty".to_string());
    }
    Ok(ItemArg {
        listing_id: listing_id.to_string(),
        quantity,
    })
}

#[derive(Clone, Copy, ValueEnum)]
enum Direction {
    Sent,
    Received,
}

#[derive(Clone, Copy, ValueEnum)]
enum Outcome {
    Release,
    Void,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Cash,
    Barter,
    Hybrid,
}

#[derive(Clone, Copy, ValueEnum)]
enum DownpaymentKind {
    Fixed,
    Percentage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Listing {
    id: String,
    owner_id: String,
    title: String,
    price_cents: u64,
    currency_code: String,
    trade_mode: String,
    open_to_offers: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferedItem {
    listing_id: String,
    quantity: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Offer {
    id: String,
    target_listing_id: String,
    buyer_id: String,
    seller_id: String,
    offered_items: Vec<OfferedItem>,
    offered_cash_cents: u64,
    currency_code: String,
    message: Option<String>,
    status: String,
    awaiting_response_from: String,
    downpayment_status: String,
    downpayment_amount_cents: u64,
    expires_at: Option<String>,
    timer_extensions: u32,
    pickup_pin: Option<String>,
    dispute_raised: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    receipt_number: String,
    offer_id: String,
    listing_title: String,
    buyer_id: String,
    seller_id: String,
    offered_items: Vec<OfferedItem>,
    cash_display: String,
    downpayment_display: String,
    completion_method: String,
    completed_at: String,
}

struct Agent {
    client: Client,
    server: String,
    user: String,
    verified: bool,
    admin: bool,
}

impl Agent {
    fn new(cli: &Cli) -> Self {
        Self {
            client: Client::new(),
            server: cli.server.trim_end_matches('/').to_string(),
            user: cli.user.clone(),
            verified: cli.verified,
            admin: cli.admin,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.server, path)
    }

    /// Attach the identity headers the server expects from its gateway.
    fn identify(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("x-user-id", &self.user)
            .header("x-user-verified", self.verified.to_string());
        if self.admin {
            request.header("x-user-role", "admin")
        } else {
            request
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let resp = self
            .identify(request)
            .send()
            .await
            .context("Failed to reach offer server")?;

        let status = resp.status();
        if !status.is_success() {
            let body: Value = resp.json().await.unwrap_or(Value::Null);
            let message = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| status.to_string());
            bail!("Server refused request ({}): {}", status.as_u16(), message);
        }

        resp.json().await.context("Unexpected response body")
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send(self.client.get(self.url(path))).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Option<Value>) -> Result<T> {
        let request = self.client.post(self.url(path));
        let request = match body {
            Some(body) => request.json(&body),
            None => request,
        };
        self.send(request).await
    }

    async fn offer_action(&self, id: &str, action: &str, body: Option<Value>) -> Result<Offer> {
        self.post(&format!("/offers/{id}/{action}"), body).await
    }

    async fn list_offers(
        &self,
        direction: Option<Direction>,
        status: Option<&str>,
        listing: Option<&str>,
    ) -> Result<Vec<Offer>> {
        let mut query = Vec::new();
        if let Some(direction) = direction {
            let value = match direction {
                Direction::Sent => "sent",
                Direction::Received => "received",
            };
            query.push(("type", value));
        }
        if let Some(status) = status {
            query.push(("status", status));
        }
        if let Some(listing) = listing {
            query.push(("listingId", listing));
        }
        self.send(self.client.get(self.url("/offers")).query(&query))
            .await
    }

    /// Decision engine for offers waiting on this user.
    ///
    /// Enough cash gets accepted. Otherwise a seller counters at the
    /// threshold once, and anything already countered by us is left alone.
    async fn auto_respond(&self, min_cash_cents: u64, dry_run: bool) -> Result<()> {
        let mut waiting = Vec::new();
        for status in ["pending", "countered"] {
            waiting.extend(self.list_offers(None, Some(status), None).await?);
        }
        waiting.retain(|offer| offer.awaiting_response_from == self.user);

        if waiting.is_empty() {
            println!("No offers waiting on {}", self.user);
            return Ok(());
        }

        for offer in waiting {
            let decision = decide(&offer, &self.user, min_cash_cents);
            println!(
                "[*] {} from {}: {} -> {}",
                offer.id,
                counterparty(&offer, &self.user),
                money(offer.offered_cash_cents, &offer.currency_code),
                decision.label()
            );
            if dry_run {
                continue;
            }

            let result = match decision {
                Decision::Accept => self.offer_action(&offer.id, "accept", None).await,
                Decision::Counter(cents) => {
                    let terms = json!({
                        "offeredCashCents": cents,
                        "offeredItems": [],
                        "currencyCode": offer.currency_code,
                    });
                    self.offer_action(&offer.id, "counter", Some(terms)).await
                }
                Decision::Reject => self.offer_action(&offer.id, "reject", None).await,
            };
            match result {
                Ok(updated) => println!("    now {}", updated.status),
                Err(e) => tracing::warn!(offer_id = %offer.id, error = %e, "Action failed"),
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Accept,
    Counter(u64),
    Reject,
}

impl Decision {
    fn label(self) -> String {
        match self {
            Decision::Accept => "accept".to_string(),
            Decision::Counter(cents) => format!("counter at {cents}"),
            Decision::Reject => "reject".to_string(),
        }
    }
}

fn decide(offer: &Offer, user: &str, min_cash_cents: u64) -> Decision {
    if offer.offered_cash_cents >= min_cash_cents {
        Decision::Accept
    } else if offer.seller_id == user && offer.status == "pending" {
        Decision::Counter(min_cash_cents)
    } else {
        Decision::Reject
    }
}

fn counterparty<'a>(offer: &'a Offer, user: &str) -> &'a str {
    if offer.buyer_id == user {
        &offer.seller_id
    } else {
        &offer.buyer_id
    }
}

fn money(cents: u64, currency: &str) -> String {
    format!("{}.{:02} {}", cents / 100, cents % 100, currency)
}

fn print_listing(listing: &Listing) {
    println!("Listing {}", listing.id);
    println!("  Title:     {}", listing.title);
    println!("  Owner:     {}", listing.owner_id);
    println!("  Price:     {}", money(listing.price_cents, &listing.currency_code));
    println!("  Mode:      {}", listing.trade_mode);
    println!("  Open:      {}", listing.open_to_offers);
}

fn print_offer(offer: &Offer) {
    println!("Offer {}", offer.id);
    println!("  Status:      {}", offer.status);
    println!("  Listing:     {}", offer.target_listing_id);
    println!("  Buyer:       {}", offer.buyer_id);
    println!("  Seller:      {}", offer.seller_id);
    println!("  Cash:        {}", money(offer.offered_cash_cents, &offer.currency_code));
    for item in &offer.offered_items {
        println!("  Item:        {} x{}", item.listing_id, item.quantity);
    }
    if let Some(message) = &offer.message {
        println!("  Message:     {}", message);
    }
    println!("  Waiting on:  {}", offer.awaiting_response_from);
    if let Some(deadline) = &offer.expires_at {
        println!(
            "  Expires:     {} ({} extensions)",
            deadline, offer.timer_extensions
        );
    }
    if offer.downpayment_status != "none" {
        println!(
            "  Downpayment: {} ({})",
            money(offer.downpayment_amount_cents, &offer.currency_code),
            offer.downpayment_status
        );
    }
    if let Some(pin) = &offer.pickup_pin {
        println!("  Pickup PIN:  {}", pin);
    }
    if offer.dispute_raised {
        println!("  Disputed:    yes");
    }
}

fn print_offer_table(offers: &[Offer]) {
    println!(
        "{:<38} {:<10} {:<12} {:<12} {:>14}",
        "ID", "Status", "Buyer", "Seller", "Cash"
    );
    println!("{}", "-".repeat(90));
    for offer in offers {
        println!(
            "{:<38} {:<10} {:<12} {:<12} {:>14}",
            offer.id,
            offer.status,
            offer.buyer_id,
            offer.seller_id,
            money(offer.offered_cash_cents, &offer.currency_code)
        );
    }
}

fn print_receipt(receipt: &Receipt) {
    println!("Receipt {}", receipt.receipt_number);
    println!("  Offer:       {}", receipt.offer_id);
    println!("  Listing:     {}", receipt.listing_title);
    println!("  Buyer:       {}", receipt.buyer_id);
    println!("  Seller:      {}", receipt.seller_id);
    println!("  Cash:        {}", receipt.cash_display);
    for item in &receipt.offered_items {
        println!("  Item:        {} x{}", item.listing_id, item.quantity);
    }
    println!("  Downpayment: {}", receipt.downpayment_display);
    println!("  Completed:   {} ({})", receipt.completed_at, receipt.completion_method);
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent=info".into()),
        )
        .init();
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let agent = Agent::new(&cli);

    match cli.command {
        Commands::Listing(ListingCommand::Create {
            title,
            price_cents,
            currency,
            mode,
        }) => {
            let mode = match mode {
                Mode::Cash => "cash",
                Mode::Barter => "barter",
                Mode::Hybrid => "hybrid",
            };
            let body = json!({
                "title": title,
                "priceCents": price_cents,
                "currencyCode": currency,
                "tradeMode": mode,
            });
            let listing: Listing = agent.post("/listings", Some(body)).await?;
            print_listing(&listing);
        }

        Commands::Listing(ListingCommand::Show { id }) => {
            let listing: Listing = agent.get(&format!("/listings/{id}")).await?;
            print_listing(&listing);
        }

        Commands::Offers {
            direction,
            status,
            listing,
        } => {
            let offers = agent
                .list_offers(direction, status.as_deref(), listing.as_deref())
                .await?;
            print_offer_table(&offers);
        }

        Commands::Show { id } => {
            let offer: Offer = agent.get(&format!("/offers/{id}")).await?;
            print_offer(&offer);
        }

        Commands::Offer { listing, terms } => {
            let mut body = terms.to_json();
            body["targetListingId"] = Value::String(listing);
            let offer: Offer = agent.post("/offers", Some(body)).await?;
            print_offer(&offer);
        }

        Commands::Counter { id, terms } => {
            print_offer(&agent.offer_action(&id, "counter", Some(terms.to_json())).await?);
        }

        Commands::Accept { id } => print_offer(&agent.offer_action(&id, "accept", None).await?),
        Commands::Reject { id } => print_offer(&agent.offer_action(&id, "reject", None).await?),
        Commands::Withdraw { id } => {
            print_offer(&agent.offer_action(&id, "withdraw", None).await?)
        }

        Commands::Extend { id, minutes } => {
            let body = minutes.map(|m| json!({ "minutes": m }));
            print_offer(&agent.offer_action(&id, "extend-timer", body).await?);
        }

        Commands::Downpayment(DownpaymentCommand::Paid { id }) => {
            print_offer(&agent.offer_action(&id, "downpayment/paid", None).await?);
        }
        Commands::Downpayment(DownpaymentCommand::Confirm { id }) => {
            print_offer(&agent.offer_action(&id, "downpayment/confirm", None).await?);
        }

        Commands::Confirm { id } => print_offer(&agent.offer_action(&id, "confirm", None).await?),
        Commands::Lock { id } => print_offer(&agent.offer_action(&id, "lock", None).await?),

        Commands::VerifyPickup { id, pin } => {
            let body = json!({ "pin": pin });
            print_offer(&agent.offer_action(&id, "verify-pickup", Some(body)).await?);
        }

        Commands::Dispute { id, reason } => {
            let body = json!({ "reason": reason });
            print_offer(&agent.offer_action(&id, "dispute", Some(body)).await?);
        }

        Commands::Resolve { id, outcome, note } => {
            let outcome = match outcome {
                Outcome::Release => "release",
                Outcome::Void => "void",
            };
            let body = json!({ "outcome": outcome, "note": note });
            print_offer(&agent.offer_action(&id, "resolve", Some(body)).await?);
        }

        Commands::Disputes => {
            let offers: Vec<Offer> = agent.get("/admin/disputes").await?;
            print_offer_table(&offers);
        }

        Commands::Receipt { id } => {
            let receipt: Receipt = agent.get(&format!("/offers/{id}/receipt")).await?;
            print_receipt(&receipt);
        }

        Commands::Settings(SettingsCommand::Show) => {
            let settings: Value = agent.get("/brand-settings").await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }

        Commands::Settings(SettingsCommand::Set {
            require_downpayment,
            downpayment_type,
            downpayment_value,
            timer,
        }) => {
            let kind = match downpayment_type {
                DownpaymentKind::Fixed => "FIXED",
                DownpaymentKind::Percentage => "PERCENTAGE",
            };
            let body = json!({
                "requireDownpayment": require_downpayment,
                "downpaymentType": kind,
                "downpaymentValue": downpayment_value,
                "defaultTimerDuration": timer,
            });
            let request = agent.client.put(agent.url("/brand-settings")).json(&body);
            let settings: Value = agent.send(request).await?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
        }

        Commands::Auto {
            min_cash_cents,
            dry_run,
        } => {
            if dry_run {
                println!("=== DRY RUN MODE ===\n");
            }
            agent.auto_respond(min_cash_cents, dry_run).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(status: &str, seller: &str, cash: u64) -> Offer {
        Offer {
            id: "o1".into(),
            target_listing_id: "l1".into(),
            buyer_id: "buyer".into(),
            seller_id: seller.into(),
            offered_items: vec![],
            offered_cash_cents: cash,
            currency_code: "USD".into(),
            message: None,
            status: status.into(),
            awaiting_response_from: seller.into(),
            downpayment_status: "none".into(),
            downpayment_amount_cents: 0,
            expires_at: None,
            timer_extensions: 0,
            pickup_pin: None,
            dispute_raised: false,
        }
    }

    #[test]
    fn test_parse_item() {
        let item = parse_item("abc:3").unwrap();
        assert_eq!(item.listing_id, "abc");
        assert_eq!(item.quantity, 3);
        assert_eq!(parse_item("abc").unwrap().quantity, 1);
        assert!(parse_item("abc:x").is_err());
        assert!(parse_item(":2").is_err());
    }

    #[test]
    fn test_decide() {
        assert_eq!(decide(&offer("pending", "me", 5000), "me", 4000), Decision::Accept);
        assert_eq!(
            decide(&offer("pending", "me", 1000), "me", 4000),
            Decision::Counter(4000)
        );
        assert_eq!(decide(&offer("countered", "me", 1000), "me", 4000), Decision::Reject);
    }

    #[test]
    fn test_money() {
        assert_eq!(money(5005, "USD"), "50.05 USD");
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "agent", "--user", "alice", "offer", "L1", "--cash", "500", "--item", "L2:2",
        ])
        .unwrap();
        assert_eq!(cli.user, "alice");
        match cli.command {
            Commands::Offer { listing, terms } => {
                assert_eq!(listing, "L1");
                assert_eq!(terms.cash, Some(500));
                assert_eq!(terms.items.len(), 1);
            }
            _ => panic!("expected offer command"),
        }
    }
}
